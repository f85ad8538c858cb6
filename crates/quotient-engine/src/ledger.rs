//! Usage Ledger
//!
//! Staleness bookkeeping for Usage rows.  Each participation in a
//! quota computation decrements `until_refresh`; at zero the ledger
//! stamps a refresh token and asks the owning service for the
//! authoritative count.  Decrements are suspended while a refresh is
//! outstanding, and a response is accepted only when its token matches
//! the outstanding one, so a stale or duplicate refresh can never
//! overwrite newer data.

use crate::model::Usage;
use tracing::warn;
use uuid::Uuid;

/// An out-of-band request for an authoritative usage count, addressed
/// to the service that owns the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    /// The usage row to refresh.
    pub usage_id: Uuid,
    /// The resource the row counts.
    pub resource_id: Uuid,
    /// Token the response must echo to be accepted.
    pub refresh_id: Uuid,
}

/// Record one participation in a quota computation.  Returns the
/// refresh request to dispatch when the countdown hits zero.
///
/// A row with `until_refresh == 0` and no outstanding token has the
/// refresh protocol disabled and never ticks.
pub fn tick(usage: &mut Usage) -> Option<RefreshRequest> {
    if usage.refresh_id.is_some() || usage.until_refresh == 0 {
        return None;
    }

    usage.until_refresh -= 1;
    if usage.until_refresh > 0 {
        return None;
    }

    let refresh_id = Uuid::new_v4();
    usage.refresh_id = Some(refresh_id);
    Some(RefreshRequest {
        usage_id: usage.id,
        resource_id: usage.resource_id,
        refresh_id,
    })
}

/// Accept or discard a refresh response.  On a token match, `used` is
/// reset to the authoritative value, the countdown is restored to
/// `interval`, and the token is cleared.  A mismatched or unsolicited
/// response is an expected race: it is logged and discarded, and the
/// row is left untouched.
pub fn apply_refresh(
    usage: &mut Usage,
    refresh_id: Uuid,
    authoritative_used: i64,
    interval: u32,
) -> bool {
    match usage.refresh_id {
        Some(outstanding) if outstanding == refresh_id => {
            usage.used = authoritative_used;
            usage.until_refresh = interval;
            usage.refresh_id = None;
            true
        }
        Some(outstanding) => {
            warn!(
                usage = %usage.id,
                expected = %outstanding,
                got = %refresh_id,
                "discarding refresh with stale token"
            );
            false
        }
        None => {
            warn!(
                usage = %usage.id,
                got = %refresh_id,
                "discarding unsolicited refresh"
            );
            false
        }
    }
}

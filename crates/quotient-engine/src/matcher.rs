//! Field-Set Matcher
//!
//! Resolves the most specific applicable Quota and the Usage row for a
//! (resource, auth-data) pair.  Quota lookup walks the category's
//! field sets in declared order, most specific first, and returns the
//! first stored quota whose auth data equals the projection exactly.
//! The terminal empty projection matches the default quota; if no
//! default row exists the resolution falls through to unlimited, so a
//! limit is always resolved.

use crate::model::{Category, Resource, SpecificResource, Usage};
use crate::store::{StoragePort, StorageTx};
use quotient_common::{project, AuthData, QuotaError, Result};

/// Resolve the applicable limit for `resource` and `auth`.
/// `None` means unlimited.
pub fn resolve_quota<S>(
    store: &S,
    category: &Category,
    resource: &Resource,
    auth: &AuthData,
) -> Result<Option<i64>>
where
    S: StoragePort + ?Sized,
{
    for fset in &category.quota_fsets {
        let projection = project(auth, fset);
        if let Some(quota) = store.find_quota(resource.id, &projection)? {
            return Ok(quota.limit);
        }
    }
    Ok(None)
}

/// Resolve the Usage row for a specific resource and caller, creating
/// a zeroed row through `tx` on first reference.  Absolute resources
/// carry no usage and are rejected here.
pub fn resolve_usage<S>(
    store: &S,
    tx: &mut dyn StorageTx,
    category: &Category,
    resource: &Resource,
    specific: &SpecificResource,
    auth: &AuthData,
    until_refresh: u32,
) -> Result<Usage>
where
    S: StoragePort + ?Sized,
{
    if resource.absolute {
        return Err(QuotaError::InvalidArgument(format!(
            "absolute resource {} has no usage record",
            specific.name()
        )));
    }

    let projection = project(auth, &category.usage_fset);
    if let Some(usage) = store.find_usage(resource.id, specific.param_data(), &projection)? {
        return Ok(usage);
    }

    let usage = Usage::new(
        resource.id,
        specific.param_data().clone(),
        projection,
        until_refresh,
    );
    tx.create_usage(usage.clone())?;
    Ok(usage)
}

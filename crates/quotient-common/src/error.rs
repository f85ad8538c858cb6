//! Error types for Quotient

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single over-quota finding within a reservation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overage {
    /// Canonical name of the offending specific resource.
    pub resource: String,
    /// The resolved limit that would be exceeded.
    pub limit: i64,
    /// The delta the caller asked for.
    pub requested: i64,
    /// Confirmed consumption at decision time.
    pub used: i64,
    /// Provisional holds at decision time.
    pub reserved: i64,
}

impl Overage {
    /// Amount still available under the limit, floored at zero.
    pub fn available(&self) -> i64 {
        self.limit
            .saturating_sub(self.used)
            .saturating_sub(self.reserved)
            .max(0)
    }
}

/// Quotient error type
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Uniqueness constraint violated on create.
    #[error("duplicate {kind}: {key}")]
    Duplicate {
        /// Entity kind, e.g. "service".
        kind: &'static str,
        /// The conflicting key.
        key: String,
    },

    /// Lookup by id, name, or exact match failed.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Entity kind, e.g. "resource".
        kind: &'static str,
        /// The key that failed to match.
        key: String,
    },

    /// Malformed lookup parameters or missing required fields.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// One or more resources in a reservation batch would exceed
    /// their limit.  The whole batch is rejected.
    #[error("over quota on {} resource(s)", .overages.len())]
    OverQuota {
        /// The offending resources with their limits and totals.
        overages: Vec<Overage>,
    },

    /// A field update request named the same field more than once.
    #[error("ambiguous update of field {field:?}")]
    AmbiguousUpdate {
        /// The field named more than once.
        field: String,
    },

    /// A refresh response's token did not match the outstanding one.
    /// Expected race; absorbed by the ledger, never surfaced to callers.
    #[error("refresh token mismatch for usage {usage}")]
    RefreshConflict {
        /// The usage row the stale refresh targeted.
        usage: Uuid,
    },

    /// Storage-level serialization conflict.  Retried by the engine a
    /// bounded number of times before becoming [`QuotaError::TransientFailure`].
    #[error("storage conflict on {kind}")]
    Conflict {
        /// Entity kind the conflicting write targeted.
        kind: &'static str,
    },

    /// Retries exhausted on a conflicting storage transaction.
    #[error("transient storage failure after {attempts} attempt(s)")]
    TransientFailure {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Backend-specific storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for Quotient
pub type Result<T> = std::result::Result<T, QuotaError>;

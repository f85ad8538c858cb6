//! Quotient Common - Shared types for the quota and reservation engine
//!
//! This crate provides the primitives shared by the engine and any
//! storage backend:
//! - Auth/parameter data maps and field-set projection
//! - Error taxonomy
//! - Engine configuration
//! - Audit timestamps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;

pub use config::EngineConfig;
pub use error::{Overage, QuotaError, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Authentication and authorization data supplied by a caller: a flat
/// mapping of identity field name to scalar value.  Kept ordered so two
/// maps with the same entries compare and serialize identically.
pub type AuthData = BTreeMap<String, String>;

/// Parameter data distinguishing instances of a parameterized resource.
pub type ParamData = BTreeMap<String, String>;

/// A set of auth-data field names used as a partial-match key.
pub type FieldSet = BTreeSet<String>;

/// Restrict `data` to only the keys named in `fields`.
pub fn project(data: &AuthData, fields: &FieldSet) -> AuthData {
    data.iter()
        .filter(|(k, _)| fields.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Build a [`FieldSet`] from string literals.
pub fn field_set<I, S>(fields: I) -> FieldSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    fields.into_iter().map(Into::into).collect()
}

/// Audit timestamps embedded by value in every persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    /// Stamp a freshly created record.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a modification.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(pairs: &[(&str, &str)]) -> AuthData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_projection_keeps_only_named_fields() {
        let data = auth(&[("tenant", "t1"), ("user", "u1"), ("extra", "x")]);
        let fields = field_set(["tenant", "user"]);

        let projected = project(&data, &fields);

        assert_eq!(projected, auth(&[("tenant", "t1"), ("user", "u1")]));
    }

    #[test]
    fn test_empty_projection() {
        let data = auth(&[("tenant", "t1")]);

        assert!(project(&data, &FieldSet::new()).is_empty());
    }

    #[test]
    fn test_audit_touch_advances_updated_at() {
        let mut audit = Audit::new();
        let created = audit.created_at;

        std::thread::sleep(std::time::Duration::from_millis(2));
        audit.touch();

        assert_eq!(audit.created_at, created);
        assert!(audit.updated_at > created);
    }
}

//! Quota Data Model
//!
//! Typed entities with explicit UUID foreign keys.  Catalog entities
//! (Service, Category, Resource) are long-lived configuration; Usage and
//! Quota rows are created lazily on first reference; Reservation and
//! ReservedItem rows live only for the span of a reservation.

use quotient_common::{Audit, AuthData, FieldSet, ParamData, QuotaError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered service that owns resources, e.g. a compute or
/// storage provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Unique service ID.
    pub id: Uuid,
    /// Unique service name, e.g. "compute".
    pub name: String,
    /// Names of the auth fields an identity on this service carries.
    pub auth_fields: FieldSet,
    /// Audit timestamps.
    pub audit: Audit,
}

impl Service {
    /// Create a new service record.
    pub fn new(name: impl Into<String>, auth_fields: FieldSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            auth_fields,
            audit: Audit::new(),
        }
    }
}

/// A category of quotas within a service.  Determines which auth
/// fields key a Usage row and which field sets, from most specific to
/// least specific, locate the applicable Quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    /// Unique category ID.
    pub id: Uuid,
    /// Owning service.
    pub service_id: Uuid,
    /// Category name, unique within the service.
    pub name: String,
    /// Auth fields keying a Usage record.
    pub usage_fset: FieldSet,
    /// Ordered auth field sets for quota lookup, most specific first,
    /// always terminated by the empty set (the default tier).
    pub quota_fsets: Vec<FieldSet>,
    /// Audit timestamps.
    pub audit: Audit,
}

/// A reservable resource within a service and category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Unique resource ID.
    pub id: Uuid,
    /// Owning service.
    pub service_id: Uuid,
    /// Owning category.
    pub category_id: Uuid,
    /// Resource name, unique within the service, e.g. "cores".
    pub name: String,
    /// Parameter field names distinguishing resource instances.
    pub params: FieldSet,
    /// Absolute resources keep no usage record; enforcement is a
    /// direct comparison of the running reservation total against
    /// the limit.
    pub absolute: bool,
    /// Audit timestamps.
    pub audit: Audit,
}

/// A resource plus concrete values for every declared parameter.
/// Identity, hashing, and ordering derive from the canonical name
/// `service/resource[/k=v...]` with parameters sorted by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecificResource {
    resource_id: Uuid,
    name: String,
    param_data: ParamData,
}

impl SpecificResource {
    /// Bind a resource to concrete parameter values.  Every field in
    /// the resource's `params` must be supplied; extra fields are
    /// rejected.
    pub fn new(service: &Service, resource: &Resource, param_data: ParamData) -> Result<Self> {
        let supplied: FieldSet = param_data.keys().cloned().collect();
        let missing: Vec<_> = resource.params.difference(&supplied).cloned().collect();
        if !missing.is_empty() {
            return Err(QuotaError::InvalidArgument(format!(
                "missing parameter data fields: {}",
                missing.join(", ")
            )));
        }
        let extra: Vec<_> = supplied.difference(&resource.params).cloned().collect();
        if !extra.is_empty() {
            return Err(QuotaError::InvalidArgument(format!(
                "unknown parameter data fields: {}",
                extra.join(", ")
            )));
        }

        let mut name = format!("{}/{}", service.name, resource.name);
        for (key, value) in &param_data {
            name.push_str(&format!("/{key}={value}"));
        }

        Ok(Self {
            resource_id: resource.id,
            name,
            param_data,
        })
    }

    /// ID of the underlying resource.
    pub fn resource_id(&self) -> Uuid {
        self.resource_id
    }

    /// Canonical name, `service/resource[/k=v...]`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concrete parameter values.
    pub fn param_data(&self) -> &ParamData {
        &self.param_data
    }
}

impl PartialEq for SpecificResource {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for SpecificResource {}

impl std::hash::Hash for SpecificResource {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for SpecificResource {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpecificResource {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// Per-resource-instance counters for one caller identity.
///
/// `used` is confirmed consumption; `reserved` holds provisional,
/// positive-only reservations.  Negative deltas never touch
/// `reserved`, so a failed deallocation cannot manufacture an
/// overage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    /// Unique usage ID.
    pub id: Uuid,
    /// The resource this usage counts.
    pub resource_id: Uuid,
    /// Parameter values of the specific resource instance.
    pub param_data: ParamData,
    /// Caller auth data projected onto the category's `usage_fset`.
    pub auth_data: AuthData,
    /// Confirmed consumption.
    pub used: i64,
    /// Provisional holds from open reservations.
    pub reserved: i64,
    /// Countdown to a forced refresh; 0 disables the protocol.
    pub until_refresh: u32,
    /// Token guarding the single in-flight refresh, if any.
    pub refresh_id: Option<Uuid>,
    /// Version counter for conflict detection on writes.
    pub version: u64,
    /// Audit timestamps.
    pub audit: Audit,
}

impl Usage {
    /// Create a zeroed usage row for lazy materialization.
    pub fn new(
        resource_id: Uuid,
        param_data: ParamData,
        auth_data: AuthData,
        until_refresh: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id,
            param_data,
            auth_data,
            used: 0,
            reserved: 0,
            until_refresh,
            refresh_id: None,
            version: 0,
            audit: Audit::new(),
        }
    }
}

/// A quota limit bound to a resource and an auth-data projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    /// Unique quota ID.
    pub id: Uuid,
    /// The resource this limit applies to.
    pub resource_id: Uuid,
    /// The exact auth-data projection this limit matches.
    pub auth_data: AuthData,
    /// The limit; `None` means unlimited.
    pub limit: Option<i64>,
    /// Audit timestamps.
    pub audit: Audit,
}

impl Quota {
    /// Create a quota record.
    pub fn new(resource_id: Uuid, auth_data: AuthData, limit: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id,
            auth_data,
            limit,
            audit: Audit::new(),
        }
    }
}

/// Reservation lifecycle state.  Open reservations transition exactly
/// once to a terminal state; repeated transition attempts are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    /// Holding provisional usage; awaiting commit or rollback.
    Open,
    /// Deltas confirmed into `used`; holds released.
    Committed,
    /// Holds released without confirming; via caller or the sweep.
    RolledBack,
}

/// A batch of provisional resource deltas created atomically and
/// pending commit or rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique reservation ID.
    pub id: Uuid,
    /// When the expiration sweep may roll this reservation back.
    pub expire: chrono::DateTime<chrono::Utc>,
    /// Lifecycle state.
    pub state: ReservationState,
    /// Audit timestamps.
    pub audit: Audit,
}

impl Reservation {
    /// Create an open reservation expiring at `expire`.
    pub fn new(expire: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            expire,
            state: ReservationState::Open,
            audit: Audit::new(),
        }
    }
}

/// A single resource delta within a reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedItem {
    /// Unique item ID.
    pub id: Uuid,
    /// Owning reservation.
    pub reservation_id: Uuid,
    /// The underlying resource.
    pub resource_id: Uuid,
    /// Canonical name of the specific resource instance.
    pub specific_name: String,
    /// The usage row holding this item's provisional delta; `None`
    /// for absolute resources.
    pub usage_id: Option<Uuid>,
    /// Reserved amount; negative for deallocation.
    pub delta: i64,
    /// Audit timestamps.
    pub audit: Audit,
}

impl ReservedItem {
    /// Create a reserved item.
    pub fn new(
        reservation_id: Uuid,
        resource_id: Uuid,
        specific_name: impl Into<String>,
        usage_id: Option<Uuid>,
        delta: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reservation_id,
            resource_id,
            specific_name: specific_name.into(),
            usage_id,
            delta,
            audit: Audit::new(),
        }
    }
}

//! Storage Port
//!
//! The narrow interface the engine requires from a persistence layer.
//! Reads are exact-match lookups keyed by projected auth/parameter
//! dictionaries; writes happen through a transaction handle that
//! commits on success and rolls back when dropped.  Usage rows carry a
//! version counter so a backend can detect conflicting writes; the
//! engine retries those a bounded number of times.

use crate::model::{
    Category, Quota, Reservation, ReservationState, Resource, ReservedItem, Service, Usage,
};
use chrono::{DateTime, Utc};
use quotient_common::{AuthData, ParamData, Result};
use uuid::Uuid;

/// Partial update for a usage row.  Unset fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UsageUpdate {
    /// New confirmed consumption.
    pub used: Option<i64>,
    /// New provisional hold total.
    pub reserved: Option<i64>,
    /// New refresh countdown.
    pub until_refresh: Option<u32>,
    /// New refresh token; `Some(None)` clears an outstanding one.
    pub refresh_id: Option<Option<Uuid>>,
}

impl UsageUpdate {
    /// True if the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.used.is_none()
            && self.reserved.is_none()
            && self.until_refresh.is_none()
            && self.refresh_id.is_none()
    }

    /// Diff `after` against `before`, producing the minimal update.
    pub fn diff(before: &Usage, after: &Usage) -> Self {
        Self {
            used: (before.used != after.used).then_some(after.used),
            reserved: (before.reserved != after.reserved).then_some(after.reserved),
            until_refresh: (before.until_refresh != after.until_refresh)
                .then_some(after.until_refresh),
            refresh_id: (before.refresh_id != after.refresh_id).then_some(after.refresh_id),
        }
    }
}

/// A mutation scope.  Writes are applied through the handle and become
/// durable on [`StorageTx::commit`]; dropping the handle without
/// committing rolls every write in the scope back.
pub trait StorageTx {
    /// Insert a service; `Duplicate` if the name is taken.
    fn create_service(&mut self, service: Service) -> Result<()>;

    /// Insert a category; `Duplicate` on (service, name).
    fn create_category(&mut self, category: Category) -> Result<()>;

    /// Insert a resource; `Duplicate` on (service, name).
    fn create_resource(&mut self, resource: Resource) -> Result<()>;

    /// Insert a quota; `Duplicate` on (resource, auth projection).
    fn create_quota(&mut self, quota: Quota) -> Result<()>;

    /// Replace a quota's limit.
    fn update_quota(&mut self, id: Uuid, limit: Option<i64>) -> Result<()>;

    /// Insert a usage row; `Duplicate` on (resource, params, auth).
    fn create_usage(&mut self, usage: Usage) -> Result<()>;

    /// Atomically apply a partial update to a usage row.  Fails with
    /// `Conflict` when the stored version differs from
    /// `expected_version`.
    fn update_usage(
        &mut self,
        id: Uuid,
        expected_version: u64,
        changes: UsageUpdate,
    ) -> Result<()>;

    /// Insert an open reservation.
    fn create_reservation(&mut self, reservation: Reservation) -> Result<()>;

    /// Insert a reserved item.
    fn create_reserved_item(&mut self, item: ReservedItem) -> Result<()>;

    /// Compare-and-swap an open reservation into a terminal state.
    /// Returns `false`, without writing, when the reservation is
    /// already finalized.  This is the finalize-exactly-once point.
    fn transition_reservation(&mut self, id: Uuid, to: ReservationState) -> Result<bool>;

    /// Make every write in this scope durable.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// The read/lookup surface plus transaction entry point the engine
/// consumes.  Implementations must offer atomic read-modify-write per
/// record; multi-row atomicity comes from the transaction scope.
pub trait StoragePort: Send + Sync {
    /// Open a mutation scope.
    fn begin(&self) -> Result<Box<dyn StorageTx + '_>>;

    /// Service by ID.
    fn service(&self, id: Uuid) -> Result<Option<Service>>;
    /// Service by unique name.
    fn service_by_name(&self, name: &str) -> Result<Option<Service>>;
    /// All registered services.
    fn services(&self) -> Result<Vec<Service>>;

    /// Category by ID.
    fn category(&self, id: Uuid) -> Result<Option<Category>>;
    /// Category by owning service and name.
    fn category_by_name(&self, service_id: Uuid, name: &str) -> Result<Option<Category>>;
    /// All categories of a service.
    fn categories(&self, service_id: Uuid) -> Result<Vec<Category>>;

    /// Resource by ID.
    fn resource(&self, id: Uuid) -> Result<Option<Resource>>;
    /// Resource by owning service and name.
    fn resource_by_name(&self, service_id: Uuid, name: &str) -> Result<Option<Resource>>;
    /// All resources of a service.
    fn resources(&self, service_id: Uuid) -> Result<Vec<Resource>>;

    /// Quota by ID.
    fn quota(&self, id: Uuid) -> Result<Option<Quota>>;
    /// Quota whose stored auth data equals `auth` exactly.
    fn find_quota(&self, resource_id: Uuid, auth: &AuthData) -> Result<Option<Quota>>;
    /// Quotas, optionally filtered by resource.
    fn quotas(&self, resource_id: Option<Uuid>) -> Result<Vec<Quota>>;

    /// Usage by ID.
    fn usage(&self, id: Uuid) -> Result<Option<Usage>>;
    /// Usage whose parameter and auth data equal the given
    /// dictionaries exactly.
    fn find_usage(
        &self,
        resource_id: Uuid,
        params: &ParamData,
        auth: &AuthData,
    ) -> Result<Option<Usage>>;
    /// Usages, optionally filtered by resource.
    fn usages(&self, resource_id: Option<Uuid>) -> Result<Vec<Usage>>;

    /// Reservation by ID.
    fn reservation(&self, id: Uuid) -> Result<Option<Reservation>>;
    /// Items belonging to a reservation, in creation order.
    fn items_for_reservation(&self, reservation_id: Uuid) -> Result<Vec<ReservedItem>>;
    /// Open reservations whose expiry precedes `cutoff`.
    fn open_reservations_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>>;

    /// Sum of positive deltas held by still-open reservations against
    /// the named specific resource.  This is the running total for
    /// absolute resources.
    fn open_positive_total(&self, specific_name: &str) -> Result<i64>;
}

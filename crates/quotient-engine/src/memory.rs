//! In-Memory Storage Port
//!
//! Reference implementation of [`StoragePort`] used by the unit suite
//! and as the template for a relational backend.  Every table is a
//! keyed concurrent map, so single-record updates are atomic per row
//! and disjoint rows never contend.  Transactions apply writes eagerly
//! and keep an undo log that is replayed in reverse when the handle is
//! dropped without committing.  Eager writes mean a reader can observe
//! pre-commit state inside a transaction window; isolation between
//! concurrent operations on the same row comes from the engine's
//! per-row locks, not from the store.

use crate::model::{
    Category, Quota, Reservation, ReservationState, Resource, ReservedItem, Service, Usage,
};
use crate::store::{StoragePort, StorageTx, UsageUpdate};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quotient_common::{AuthData, ParamData, QuotaError, Result};
use uuid::Uuid;

fn dict_key(map: &std::collections::BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(map).map_err(|e| QuotaError::Storage(e.to_string()))
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStore {
    services: DashMap<Uuid, Service>,
    service_names: DashMap<String, Uuid>,
    categories: DashMap<Uuid, Category>,
    category_names: DashMap<(Uuid, String), Uuid>,
    resources: DashMap<Uuid, Resource>,
    resource_names: DashMap<(Uuid, String), Uuid>,
    quotas: DashMap<Uuid, Quota>,
    // (resource_id, auth json)
    quota_index: DashMap<(Uuid, String), Uuid>,
    usages: DashMap<Uuid, Usage>,
    // (resource_id, param json, auth json)
    usage_index: DashMap<(Uuid, String, String), Uuid>,
    reservations: DashMap<Uuid, Reservation>,
    items: DashMap<Uuid, ReservedItem>,
    items_by_reservation: DashMap<Uuid, Vec<Uuid>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

enum Undo {
    RemoveService(Uuid, String),
    RemoveCategory(Uuid, (Uuid, String)),
    RemoveResource(Uuid, (Uuid, String)),
    RemoveQuota(Uuid, (Uuid, String)),
    RestoreQuota(Quota),
    RemoveUsage(Uuid, (Uuid, String, String)),
    RestoreUsage(Usage),
    RemoveReservation(Uuid),
    RestoreReservation(Reservation),
    RemoveItem(Uuid),
}

/// Undo-logged transaction over a [`MemoryStore`].
pub struct MemoryTx<'a> {
    store: &'a MemoryStore,
    undo: Vec<Undo>,
    committed: bool,
}

impl StorageTx for MemoryTx<'_> {
    fn create_service(&mut self, service: Service) -> Result<()> {
        match self.store.service_names.entry(service.name.clone()) {
            Entry::Occupied(_) => Err(QuotaError::Duplicate {
                kind: "service",
                key: service.name,
            }),
            Entry::Vacant(slot) => {
                slot.insert(service.id);
                self.undo
                    .push(Undo::RemoveService(service.id, service.name.clone()));
                self.store.services.insert(service.id, service);
                Ok(())
            }
        }
    }

    fn create_category(&mut self, category: Category) -> Result<()> {
        let key = (category.service_id, category.name.clone());
        match self.store.category_names.entry(key.clone()) {
            Entry::Occupied(_) => Err(QuotaError::Duplicate {
                kind: "category",
                key: category.name,
            }),
            Entry::Vacant(slot) => {
                slot.insert(category.id);
                self.undo.push(Undo::RemoveCategory(category.id, key));
                self.store.categories.insert(category.id, category);
                Ok(())
            }
        }
    }

    fn create_resource(&mut self, resource: Resource) -> Result<()> {
        let key = (resource.service_id, resource.name.clone());
        match self.store.resource_names.entry(key.clone()) {
            Entry::Occupied(_) => Err(QuotaError::Duplicate {
                kind: "resource",
                key: resource.name,
            }),
            Entry::Vacant(slot) => {
                slot.insert(resource.id);
                self.undo.push(Undo::RemoveResource(resource.id, key));
                self.store.resources.insert(resource.id, resource);
                Ok(())
            }
        }
    }

    fn create_quota(&mut self, quota: Quota) -> Result<()> {
        let key = (quota.resource_id, dict_key(&quota.auth_data)?);
        match self.store.quota_index.entry(key.clone()) {
            Entry::Occupied(_) => Err(QuotaError::Duplicate {
                kind: "quota",
                key: key.1,
            }),
            Entry::Vacant(slot) => {
                slot.insert(quota.id);
                self.undo.push(Undo::RemoveQuota(quota.id, key));
                self.store.quotas.insert(quota.id, quota);
                Ok(())
            }
        }
    }

    fn update_quota(&mut self, id: Uuid, limit: Option<i64>) -> Result<()> {
        let mut quota = self.store.quotas.get_mut(&id).ok_or(QuotaError::NotFound {
            kind: "quota",
            key: id.to_string(),
        })?;
        self.undo.push(Undo::RestoreQuota(quota.clone()));
        quota.limit = limit;
        quota.audit.touch();
        Ok(())
    }

    fn create_usage(&mut self, usage: Usage) -> Result<()> {
        let key = (
            usage.resource_id,
            dict_key(&usage.param_data)?,
            dict_key(&usage.auth_data)?,
        );
        match self.store.usage_index.entry(key.clone()) {
            Entry::Occupied(_) => Err(QuotaError::Duplicate {
                kind: "usage",
                key: format!("{}/{}", key.1, key.2),
            }),
            Entry::Vacant(slot) => {
                slot.insert(usage.id);
                self.undo.push(Undo::RemoveUsage(usage.id, key));
                self.store.usages.insert(usage.id, usage);
                Ok(())
            }
        }
    }

    fn update_usage(
        &mut self,
        id: Uuid,
        expected_version: u64,
        changes: UsageUpdate,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut usage = self.store.usages.get_mut(&id).ok_or(QuotaError::NotFound {
            kind: "usage",
            key: id.to_string(),
        })?;
        if usage.version != expected_version {
            return Err(QuotaError::Conflict { kind: "usage" });
        }
        self.undo.push(Undo::RestoreUsage(usage.clone()));
        if let Some(used) = changes.used {
            usage.used = used;
        }
        if let Some(reserved) = changes.reserved {
            usage.reserved = reserved;
        }
        if let Some(until_refresh) = changes.until_refresh {
            usage.until_refresh = until_refresh;
        }
        if let Some(refresh_id) = changes.refresh_id {
            usage.refresh_id = refresh_id;
        }
        usage.version += 1;
        usage.audit.touch();
        Ok(())
    }

    fn create_reservation(&mut self, reservation: Reservation) -> Result<()> {
        self.undo.push(Undo::RemoveReservation(reservation.id));
        self.store
            .items_by_reservation
            .insert(reservation.id, Vec::new());
        self.store.reservations.insert(reservation.id, reservation);
        Ok(())
    }

    fn create_reserved_item(&mut self, item: ReservedItem) -> Result<()> {
        if !self.store.reservations.contains_key(&item.reservation_id) {
            return Err(QuotaError::NotFound {
                kind: "reservation",
                key: item.reservation_id.to_string(),
            });
        }
        self.undo.push(Undo::RemoveItem(item.id));
        self.store
            .items_by_reservation
            .entry(item.reservation_id)
            .or_default()
            .push(item.id);
        self.store.items.insert(item.id, item);
        Ok(())
    }

    fn transition_reservation(&mut self, id: Uuid, to: ReservationState) -> Result<bool> {
        let mut reservation =
            self.store
                .reservations
                .get_mut(&id)
                .ok_or(QuotaError::NotFound {
                    kind: "reservation",
                    key: id.to_string(),
                })?;
        if reservation.state != ReservationState::Open {
            return Ok(false);
        }
        self.undo.push(Undo::RestoreReservation(reservation.clone()));
        reservation.state = to;
        reservation.audit.touch();
        Ok(true)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for op in self.undo.drain(..).rev() {
            match op {
                Undo::RemoveService(id, name) => {
                    self.store.services.remove(&id);
                    self.store.service_names.remove(&name);
                }
                Undo::RemoveCategory(id, key) => {
                    self.store.categories.remove(&id);
                    self.store.category_names.remove(&key);
                }
                Undo::RemoveResource(id, key) => {
                    self.store.resources.remove(&id);
                    self.store.resource_names.remove(&key);
                }
                Undo::RemoveQuota(id, key) => {
                    self.store.quotas.remove(&id);
                    self.store.quota_index.remove(&key);
                }
                Undo::RestoreQuota(quota) => {
                    self.store.quotas.insert(quota.id, quota);
                }
                Undo::RemoveUsage(id, key) => {
                    self.store.usages.remove(&id);
                    self.store.usage_index.remove(&key);
                }
                Undo::RestoreUsage(usage) => {
                    self.store.usages.insert(usage.id, usage);
                }
                Undo::RemoveReservation(id) => {
                    self.store.reservations.remove(&id);
                    self.store.items_by_reservation.remove(&id);
                }
                Undo::RestoreReservation(reservation) => {
                    self.store
                        .reservations
                        .insert(reservation.id, reservation);
                }
                Undo::RemoveItem(id) => {
                    if let Some((_, item)) = self.store.items.remove(&id) {
                        if let Some(mut ids) =
                            self.store.items_by_reservation.get_mut(&item.reservation_id)
                        {
                            ids.retain(|item_id| *item_id != id);
                        }
                    }
                }
            }
        }
    }
}

impl StoragePort for MemoryStore {
    fn begin(&self) -> Result<Box<dyn StorageTx + '_>> {
        Ok(Box::new(MemoryTx {
            store: self,
            undo: Vec::new(),
            committed: false,
        }))
    }

    fn service(&self, id: Uuid) -> Result<Option<Service>> {
        Ok(self.services.get(&id).map(|s| s.clone()))
    }

    fn service_by_name(&self, name: &str) -> Result<Option<Service>> {
        Ok(self
            .service_names
            .get(name)
            .and_then(|id| self.services.get(&id).map(|s| s.clone())))
    }

    fn services(&self) -> Result<Vec<Service>> {
        Ok(self.services.iter().map(|s| s.clone()).collect())
    }

    fn category(&self, id: Uuid) -> Result<Option<Category>> {
        Ok(self.categories.get(&id).map(|c| c.clone()))
    }

    fn category_by_name(&self, service_id: Uuid, name: &str) -> Result<Option<Category>> {
        Ok(self
            .category_names
            .get(&(service_id, name.to_string()))
            .and_then(|id| self.categories.get(&id).map(|c| c.clone())))
    }

    fn categories(&self, service_id: Uuid) -> Result<Vec<Category>> {
        Ok(self
            .categories
            .iter()
            .filter(|c| c.service_id == service_id)
            .map(|c| c.clone())
            .collect())
    }

    fn resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(self.resources.get(&id).map(|r| r.clone()))
    }

    fn resource_by_name(&self, service_id: Uuid, name: &str) -> Result<Option<Resource>> {
        Ok(self
            .resource_names
            .get(&(service_id, name.to_string()))
            .and_then(|id| self.resources.get(&id).map(|r| r.clone())))
    }

    fn resources(&self, service_id: Uuid) -> Result<Vec<Resource>> {
        Ok(self
            .resources
            .iter()
            .filter(|r| r.service_id == service_id)
            .map(|r| r.clone())
            .collect())
    }

    fn quota(&self, id: Uuid) -> Result<Option<Quota>> {
        Ok(self.quotas.get(&id).map(|q| q.clone()))
    }

    fn find_quota(&self, resource_id: Uuid, auth: &AuthData) -> Result<Option<Quota>> {
        let key = (resource_id, dict_key(auth)?);
        Ok(self
            .quota_index
            .get(&key)
            .and_then(|id| self.quotas.get(&id).map(|q| q.clone())))
    }

    fn quotas(&self, resource_id: Option<Uuid>) -> Result<Vec<Quota>> {
        Ok(self
            .quotas
            .iter()
            .filter(|q| resource_id.map_or(true, |id| q.resource_id == id))
            .map(|q| q.clone())
            .collect())
    }

    fn usage(&self, id: Uuid) -> Result<Option<Usage>> {
        Ok(self.usages.get(&id).map(|u| u.clone()))
    }

    fn find_usage(
        &self,
        resource_id: Uuid,
        params: &ParamData,
        auth: &AuthData,
    ) -> Result<Option<Usage>> {
        let key = (resource_id, dict_key(params)?, dict_key(auth)?);
        Ok(self
            .usage_index
            .get(&key)
            .and_then(|id| self.usages.get(&id).map(|u| u.clone())))
    }

    fn usages(&self, resource_id: Option<Uuid>) -> Result<Vec<Usage>> {
        Ok(self
            .usages
            .iter()
            .filter(|u| resource_id.map_or(true, |id| u.resource_id == id))
            .map(|u| u.clone())
            .collect())
    }

    fn reservation(&self, id: Uuid) -> Result<Option<Reservation>> {
        Ok(self.reservations.get(&id).map(|r| r.clone()))
    }

    fn items_for_reservation(&self, reservation_id: Uuid) -> Result<Vec<ReservedItem>> {
        let Some(ids) = self.items_by_reservation.get(&reservation_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.items.get(id).map(|item| item.clone()))
            .collect())
    }

    fn open_reservations_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        Ok(self
            .reservations
            .iter()
            .filter(|r| r.state == ReservationState::Open && r.expire < cutoff)
            .map(|r| r.clone())
            .collect())
    }

    fn open_positive_total(&self, specific_name: &str) -> Result<i64> {
        let mut total = 0;
        for item in self.items.iter() {
            if item.specific_name != specific_name || item.delta <= 0 {
                continue;
            }
            let open = self
                .reservations
                .get(&item.reservation_id)
                .map(|r| r.state == ReservationState::Open)
                .unwrap_or(false);
            if open {
                total += item.delta;
            }
        }
        Ok(total)
    }
}

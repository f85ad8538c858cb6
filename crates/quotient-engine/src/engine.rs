//! Reservation Engine
//!
//! The two-phase reserve → commit | rollback protocol over shared
//! usage counters.  A batch is checked and applied under per-row locks
//! acquired in canonical order inside one storage transaction, so no
//! interleaving can push `used + reserved` past a finite limit, and an
//! over-quota batch leaves no partial effects.  Reservations that are
//! never finalized are rolled back by the expiration sweep.

use crate::identity::{Request, ServiceUser};
use crate::ledger::{self, RefreshRequest};
use crate::matcher;
use crate::model::{
    Category, Reservation, ReservationState, Resource, ReservedItem, SpecificResource, Usage,
};
use crate::store::{StoragePort, UsageUpdate};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use quotient_common::{project, AuthData, EngineConfig, Overage, ParamData, QuotaError, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn usage_lock_key(resource_id: Uuid, params: &ParamData, auth: &AuthData) -> Result<String> {
    let params = serde_json::to_string(params).map_err(|e| QuotaError::Storage(e.to_string()))?;
    let auth = serde_json::to_string(auth).map_err(|e| QuotaError::Storage(e.to_string()))?;
    Ok(format!("{resource_id}|{params}|{auth}"))
}

struct PlannedItem {
    specific: SpecificResource,
    delta: i64,
    resource: Resource,
    category: Category,
    lock_key: String,
}

/// The reservation engine.  Shared across callers; all operations take
/// `&self`.
pub struct ReservationEngine<S> {
    store: Arc<S>,
    config: EngineConfig,
    /// One mutex per usage row (or absolute resource instance).
    /// Serializes the read-check-write cycle for that row; disjoint
    /// rows proceed independently.  Entries are evicted once no
    /// caller holds them, so the table tracks rows in flight rather
    /// than every row ever touched.
    locks: DashMap<String, Arc<Mutex<()>>>,
    refresh_tx: Option<mpsc::UnboundedSender<RefreshRequest>>,
}

impl<S: StoragePort> ReservationEngine<S> {
    /// Create an engine over `store`.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            locks: DashMap::new(),
            refresh_tx: None,
        }
    }

    /// Deliver usage refresh requests on `sender` as they are stamped.
    pub fn with_refresh_channel(mut self, sender: mpsc::UnboundedSender<RefreshRequest>) -> Self {
        self.refresh_tx = Some(sender);
        self
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reserve a batch of resource deltas for the requesting user.
    ///
    /// All-or-nothing: if any resource in the batch would exceed its
    /// resolved limit, the whole request fails with `OverQuota` naming
    /// every offending resource, and nothing is applied.  On success
    /// the returned reservation holds the positive deltas provisionally
    /// until `commit`, `rollback`, or the expiration sweep.
    pub fn reserve(&self, request: &Request) -> Result<Reservation> {
        if request.deltas.is_empty() {
            return Err(QuotaError::InvalidArgument(
                "empty reservation request".into(),
            ));
        }

        let mut planned = Vec::with_capacity(request.deltas.len());
        for (specific, delta) in &request.deltas {
            let resource =
                self.store
                    .resource(specific.resource_id())?
                    .ok_or(QuotaError::NotFound {
                        kind: "resource",
                        key: specific.name().to_string(),
                    })?;
            if resource.service_id != request.svc_user.service_id {
                return Err(QuotaError::InvalidArgument(format!(
                    "resource {} does not belong to the caller's service",
                    specific.name()
                )));
            }
            let category =
                self.store
                    .category(resource.category_id)?
                    .ok_or(QuotaError::NotFound {
                        kind: "category",
                        key: resource.category_id.to_string(),
                    })?;
            let lock_key = if resource.absolute {
                format!("abs|{}", specific.name())
            } else {
                let projection = project(&request.svc_user.auth_data, &category.usage_fset);
                usage_lock_key(resource.id, specific.param_data(), &projection)?
            };
            planned.push(PlannedItem {
                specific: specific.clone(),
                delta: *delta,
                resource,
                category,
                lock_key,
            });
        }
        // Canonical batch order: every caller processes overlapping
        // batches in the same sequence.
        planned.sort_by(|a, b| a.specific.cmp(&b.specific));

        let mut keys: Vec<String> = planned.iter().map(|p| p.lock_key.clone()).collect();
        keys.sort();
        keys.dedup();
        let locks = self.row_locks(&keys);
        let guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();

        let mut attempts: u32 = 0;
        let outcome = loop {
            match self.try_reserve(request, &planned) {
                Err(QuotaError::Conflict { .. }) if attempts < self.config.max_txn_retries => {
                    attempts += 1;
                    warn!(
                        request_id = %request.request_id,
                        attempts,
                        "retrying reservation after storage conflict"
                    );
                }
                Err(QuotaError::Conflict { .. }) => {
                    break Err(QuotaError::TransientFailure {
                        attempts: attempts + 1,
                    })
                }
                other => break other,
            }
        };
        drop(guards);
        drop(locks);
        self.release_row_locks(&keys);
        outcome
    }

    fn try_reserve(&self, request: &Request, planned: &[PlannedItem]) -> Result<Reservation> {
        let mut tx = self.store.begin()?;
        let mut overages = Vec::new();
        let mut refreshes = Vec::new();
        let mut touched: Vec<(Usage, Usage)> = Vec::new();
        let mut usage_ids: Vec<Option<Uuid>> = Vec::with_capacity(planned.len());

        for item in planned {
            let limit = matcher::resolve_quota(
                self.store.as_ref(),
                &item.category,
                &item.resource,
                &request.svc_user.auth_data,
            )?;

            if item.resource.absolute {
                usage_ids.push(None);
                let total = self.store.open_positive_total(item.specific.name())?;
                if let Some(limit) = limit {
                    // A projection that overflows i64 is over any
                    // finite limit.
                    let fits = total
                        .checked_add(item.delta)
                        .map_or(false, |projected| projected <= limit);
                    if item.delta > 0 && !fits {
                        overages.push(Overage {
                            resource: item.specific.name().to_string(),
                            limit,
                            requested: item.delta,
                            used: total,
                            reserved: 0,
                        });
                    }
                }
            } else {
                let before = matcher::resolve_usage(
                    self.store.as_ref(),
                    tx.as_mut(),
                    &item.category,
                    &item.resource,
                    &item.specific,
                    &request.svc_user.auth_data,
                    self.config.until_refresh,
                )?;
                let mut after = before.clone();
                if let Some(refresh) = ledger::tick(&mut after) {
                    refreshes.push(refresh);
                }
                if let Some(limit) = limit {
                    let fits = after
                        .used
                        .checked_add(after.reserved)
                        .and_then(|held| held.checked_add(item.delta))
                        .map_or(false, |projected| projected <= limit);
                    if item.delta > 0 && !fits {
                        overages.push(Overage {
                            resource: item.specific.name().to_string(),
                            limit,
                            requested: item.delta,
                            used: after.used,
                            reserved: after.reserved,
                        });
                    }
                }
                if item.delta > 0 {
                    after.reserved = after.reserved.saturating_add(item.delta);
                }
                usage_ids.push(Some(before.id));
                touched.push((before, after));
            }
        }

        if !overages.is_empty() {
            // Dropping the transaction discards lazily created rows;
            // the refresh stamps computed above are discarded with it.
            debug!(
                request_id = %request.request_id,
                count = overages.len(),
                "reservation rejected over quota"
            );
            return Err(QuotaError::OverQuota { overages });
        }

        let reservation = Reservation::new(Utc::now() + self.config.reservation_ttl());
        tx.create_reservation(reservation.clone())?;
        for (item, usage_id) in planned.iter().zip(&usage_ids) {
            tx.create_reserved_item(ReservedItem::new(
                reservation.id,
                item.resource.id,
                item.specific.name(),
                *usage_id,
                item.delta,
            ))?;
        }
        for (before, after) in &touched {
            tx.update_usage(before.id, before.version, UsageUpdate::diff(before, after))?;
        }
        tx.commit()?;

        for refresh in refreshes {
            self.dispatch_refresh(refresh);
        }
        debug!(
            request_id = %request.request_id,
            reservation = %reservation.id,
            items = planned.len(),
            "reservation opened"
        );
        Ok(reservation)
    }

    /// Confirm a reservation: every delta is added to `used` and the
    /// provisional holds are released.  Committing an already finalized
    /// reservation is a no-op.
    pub fn commit(&self, reservation_id: Uuid) -> Result<()> {
        if self.finalize(reservation_id, ReservationState::Committed)? {
            debug!(reservation = %reservation_id, "reservation committed");
        }
        Ok(())
    }

    /// Release a reservation's provisional holds without confirming.
    /// Rolling back an already finalized reservation is a no-op.
    pub fn rollback(&self, reservation_id: Uuid) -> Result<()> {
        if self.finalize(reservation_id, ReservationState::RolledBack)? {
            debug!(reservation = %reservation_id, "reservation rolled back");
        }
        Ok(())
    }

    /// Roll back every open reservation whose expiry precedes `now`.
    /// Returns the number actually swept; reservations finalized by a
    /// racing caller are skipped.
    pub fn expire_reservations(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut swept = 0;
        for reservation in self.store.open_reservations_expiring_before(now)? {
            if self.finalize(reservation.id, ReservationState::RolledBack)? {
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "rolled back expired reservations");
        }
        Ok(swept)
    }

    fn finalize(&self, reservation_id: Uuid, target: ReservationState) -> Result<bool> {
        let reservation =
            self.store
                .reservation(reservation_id)?
                .ok_or(QuotaError::NotFound {
                    kind: "reservation",
                    key: reservation_id.to_string(),
                })?;
        if reservation.state != ReservationState::Open {
            debug!(
                reservation = %reservation_id,
                state = ?reservation.state,
                "reservation already finalized"
            );
            return Ok(false);
        }

        let mut keys = Vec::new();
        let mut usage_deltas = Vec::new();
        for item in self.store.items_for_reservation(reservation_id)? {
            if let Some(usage_id) = item.usage_id {
                let usage = self.store.usage(usage_id)?.ok_or(QuotaError::NotFound {
                    kind: "usage",
                    key: usage_id.to_string(),
                })?;
                keys.push(usage_lock_key(
                    usage.resource_id,
                    &usage.param_data,
                    &usage.auth_data,
                )?);
                usage_deltas.push((usage_id, item.delta));
            }
        }
        keys.sort();
        keys.dedup();
        let locks = self.row_locks(&keys);
        let guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();

        let mut attempts: u32 = 0;
        let outcome = loop {
            match self.try_finalize(reservation_id, target, &usage_deltas) {
                Err(QuotaError::Conflict { .. }) if attempts < self.config.max_txn_retries => {
                    attempts += 1;
                    warn!(
                        reservation = %reservation_id,
                        attempts,
                        "retrying finalization after storage conflict"
                    );
                }
                Err(QuotaError::Conflict { .. }) => {
                    break Err(QuotaError::TransientFailure {
                        attempts: attempts + 1,
                    })
                }
                other => break other,
            }
        };
        drop(guards);
        drop(locks);
        self.release_row_locks(&keys);
        outcome
    }

    fn try_finalize(
        &self,
        reservation_id: Uuid,
        target: ReservationState,
        usage_deltas: &[(Uuid, i64)],
    ) -> Result<bool> {
        let mut tx = self.store.begin()?;
        // The open → terminal transition is the finalize-exactly-once
        // point; losing the race is a silent no-op.
        if !tx.transition_reservation(reservation_id, target)? {
            return Ok(false);
        }

        for (usage_id, delta) in usage_deltas {
            let before = self.store.usage(*usage_id)?.ok_or(QuotaError::NotFound {
                kind: "usage",
                key: usage_id.to_string(),
            })?;
            let mut after = before.clone();
            match target {
                ReservationState::Committed => {
                    after.used = after.used.saturating_add(*delta).max(0);
                    if *delta > 0 {
                        after.reserved = after.reserved.saturating_sub(*delta).max(0);
                    }
                }
                ReservationState::RolledBack => {
                    if *delta > 0 {
                        after.reserved = after.reserved.saturating_sub(*delta).max(0);
                    }
                }
                ReservationState::Open => {
                    return Err(QuotaError::InvalidArgument(
                        "cannot finalize a reservation to the open state".into(),
                    ))
                }
            }
            tx.update_usage(before.id, before.version, UsageUpdate::diff(&before, &after))?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Accept a usage refresh from the owning service.  Returns whether
    /// the response was applied; a stale or unsolicited token is an
    /// expected race and is absorbed, not an error.
    pub fn refresh_usage(
        &self,
        usage_id: Uuid,
        refresh_id: Uuid,
        authoritative_used: i64,
    ) -> Result<bool> {
        let current = self.store.usage(usage_id)?.ok_or(QuotaError::NotFound {
            kind: "usage",
            key: usage_id.to_string(),
        })?;
        let key = usage_lock_key(current.resource_id, &current.param_data, &current.auth_data)?;
        let locks = self.row_locks(std::slice::from_ref(&key));
        let guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();

        let mut attempts: u32 = 0;
        let outcome = loop {
            match self.try_refresh(usage_id, refresh_id, authoritative_used) {
                Err(QuotaError::Conflict { .. }) if attempts < self.config.max_txn_retries => {
                    attempts += 1;
                }
                Err(QuotaError::Conflict { .. }) => {
                    break Err(QuotaError::TransientFailure {
                        attempts: attempts + 1,
                    })
                }
                other => break other,
            }
        };
        drop(guards);
        drop(locks);
        self.release_row_locks(std::slice::from_ref(&key));
        outcome
    }

    fn try_refresh(&self, usage_id: Uuid, refresh_id: Uuid, authoritative_used: i64) -> Result<bool> {
        let before = self.store.usage(usage_id)?.ok_or(QuotaError::NotFound {
            kind: "usage",
            key: usage_id.to_string(),
        })?;
        let mut after = before.clone();
        if !ledger::apply_refresh(
            &mut after,
            refresh_id,
            authoritative_used,
            self.config.until_refresh,
        ) {
            return Ok(false);
        }
        let mut tx = self.store.begin()?;
        tx.update_usage(before.id, before.version, UsageUpdate::diff(&before, &after))?;
        tx.commit()?;
        Ok(true)
    }

    /// Reservation by ID.
    pub fn reservation(&self, id: Uuid) -> Result<Reservation> {
        self.store.reservation(id)?.ok_or(QuotaError::NotFound {
            kind: "reservation",
            key: id.to_string(),
        })
    }

    /// The usage row a reservation for (`svc_user`, `specific`) would
    /// count against, if it has been materialized.
    pub fn current_usage(
        &self,
        svc_user: &ServiceUser,
        specific: &SpecificResource,
    ) -> Result<Option<Usage>> {
        let resource =
            self.store
                .resource(specific.resource_id())?
                .ok_or(QuotaError::NotFound {
                    kind: "resource",
                    key: specific.name().to_string(),
                })?;
        let category = self
            .store
            .category(resource.category_id)?
            .ok_or(QuotaError::NotFound {
                kind: "category",
                key: resource.category_id.to_string(),
            })?;
        let projection = project(&svc_user.auth_data, &category.usage_fset);
        self.store
            .find_usage(resource.id, specific.param_data(), &projection)
    }

    fn dispatch_refresh(&self, refresh: RefreshRequest) {
        debug!(
            usage = %refresh.usage_id,
            refresh = %refresh.refresh_id,
            "requesting usage refresh"
        );
        if let Some(sender) = &self.refresh_tx {
            if sender.send(refresh).is_err() {
                warn!("refresh channel closed; dropping refresh request");
            }
        }
    }

    /// Arcs for the given pre-sorted, deduplicated lock keys.
    fn row_locks(&self, keys: &[String]) -> Vec<Arc<Mutex<()>>> {
        keys.iter()
            .map(|key| {
                self.locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            })
            .collect()
    }

    /// Evict lock-table entries no other caller is holding.  Every
    /// clone of an entry's `Arc` is taken under the map's shard lock,
    /// so a strong count of 1 inside `remove_if` means only the table
    /// itself still refers to the mutex.
    fn release_row_locks(&self, keys: &[String]) {
        for key in keys {
            self.locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

impl<S: StoragePort + 'static> ReservationEngine<S> {
    /// Spawn the periodic expiration sweep on the current tokio
    /// runtime.  The task runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = engine.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = engine.expire_reservations(Utc::now()) {
                    warn!(%error, "expiration sweep failed");
                }
            }
        })
    }
}

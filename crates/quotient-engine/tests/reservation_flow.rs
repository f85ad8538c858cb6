//! End-to-end reservation protocol tests: concurrent enforcement,
//! finalize races, storage conflict retries, and the usage refresh
//! loop.

use quotient_engine::{
    field_set, AuthData, Catalog, Category, EngineConfig, MemoryStore, ParamData, Quota,
    QuotaError, Request, RequestContext, Reservation, ReservationEngine, ReservationState,
    ReservedItem, Resource, Result, Service, ServiceUser, SpecificResource, StoragePort,
    StorageTx, Usage, UsageUpdate,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

fn auth(pairs: &[(&str, &str)]) -> AuthData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct World {
    store: Arc<MemoryStore>,
    service: Service,
    cores: SpecificResource,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One service, one per-tenant category, one usage-tracked resource
/// "cores" with the given limit for tenant t1.
fn world(limit: i64) -> World {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let catalog = Catalog::new(Arc::clone(&store));
    let ctx = RequestContext::admin();

    let service = catalog
        .create_service(&ctx, "compute", field_set(["tenant_id"]))
        .unwrap();
    let category = catalog
        .create_category(
            &ctx,
            service.id,
            "per-tenant",
            field_set(["tenant_id"]),
            vec![field_set(["tenant_id"])],
        )
        .unwrap();
    let resource = catalog
        .create_resource(
            &ctx,
            service.id,
            category.id,
            "cores",
            Default::default(),
            false,
        )
        .unwrap();
    catalog
        .create_quota(&ctx, resource.id, auth(&[("tenant_id", "t1")]), Some(limit))
        .unwrap();

    let cores = SpecificResource::new(&service, &resource, Default::default()).unwrap();
    World {
        store,
        service,
        cores,
    }
}

fn tenant_user(world: &World, tenant: &str) -> ServiceUser {
    ServiceUser::new(&world.service, auth(&[("tenant_id", tenant)])).unwrap()
}

fn one_core(world: &World, user: &ServiceUser, delta: i64) -> Request {
    let mut deltas = HashMap::new();
    deltas.insert(world.cores.clone(), delta);
    Request::new(user.clone(), deltas)
}

fn config(until_refresh: u32) -> EngineConfig {
    EngineConfig {
        until_refresh,
        ..EngineConfig::default()
    }
}

fn usage_row(engine: &ReservationEngine<MemoryStore>, world: &World, user: &ServiceUser) -> Usage {
    engine
        .current_usage(user, &world.cores)
        .unwrap()
        .expect("usage row materialized")
}

#[test]
fn test_concurrent_reservers_never_exceed_limit() {
    let limit = 10;
    let contenders = 32;

    let world = world(limit);
    let engine = Arc::new(ReservationEngine::new(Arc::clone(&world.store), config(0)));
    let world = Arc::new(world);
    let user = tenant_user(&world, "t1");

    let mut handles = Vec::new();
    for _ in 0..contenders {
        let engine = Arc::clone(&engine);
        let world = Arc::clone(&world);
        let user = user.clone();
        handles.push(std::thread::spawn(move || {
            match engine.reserve(&one_core(&world, &user, 1)) {
                Ok(reservation) => {
                    engine.commit(reservation.id).unwrap();
                    true
                }
                Err(QuotaError::OverQuota { .. }) => false,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }));
    }

    let granted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|granted| *granted)
        .count();

    assert_eq!(granted as i64, limit);
    let row = usage_row(&engine, &world, &user);
    assert_eq!((row.used, row.reserved), (limit, 0));
}

#[test]
fn test_commit_and_sweep_race_finalizes_once() {
    for _ in 0..50 {
        let world = world(100);
        let engine = Arc::new(ReservationEngine::new(Arc::clone(&world.store), config(0)));
        let user = tenant_user(&world, "t1");

        let reservation = engine.reserve(&one_core(&world, &user, 4)).unwrap();
        let cutoff = reservation.expire + chrono::Duration::seconds(1);

        let committer = {
            let engine = Arc::clone(&engine);
            let id = reservation.id;
            std::thread::spawn(move || engine.commit(id).unwrap())
        };
        let sweeper = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.expire_reservations(cutoff).unwrap())
        };
        committer.join().unwrap();
        sweeper.join().unwrap();

        // Exactly one side won; the counters match the winner and the
        // hold was released exactly once either way.
        let row = usage_row(&engine, &world, &user);
        match engine.reservation(reservation.id).unwrap().state {
            ReservationState::Committed => assert_eq!((row.used, row.reserved), (4, 0)),
            ReservationState::RolledBack => assert_eq!((row.used, row.reserved), (0, 0)),
            ReservationState::Open => panic!("reservation left open"),
        }
    }
}

#[test]
fn test_tenants_consume_independent_usage() {
    let world = world(10);
    let engine = ReservationEngine::new(Arc::clone(&world.store), config(0));

    let t1 = tenant_user(&world, "t1");
    let t2 = tenant_user(&world, "t2");

    let a = engine.reserve(&one_core(&world, &t1, 7)).unwrap();
    let b = engine.reserve(&one_core(&world, &t2, 9)).unwrap();
    engine.commit(a.id).unwrap();
    engine.commit(b.id).unwrap();

    assert_eq!(usage_row(&engine, &world, &t1).used, 7);
    assert_eq!(usage_row(&engine, &world, &t2).used, 9);

    // t1's remaining headroom is unaffected by t2.
    engine.reserve(&one_core(&world, &t1, 3)).unwrap();
    let err = engine.reserve(&one_core(&world, &t1, 1)).unwrap_err();
    assert!(matches!(err, QuotaError::OverQuota { .. }));
}

#[test]
fn test_refresh_loop_end_to_end() {
    let world = world(100);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = ReservationEngine::new(Arc::clone(&world.store), config(2))
        .with_refresh_channel(tx);
    let user = tenant_user(&world, "t1");

    // Two participations exhaust the countdown.
    let first = engine.reserve(&one_core(&world, &user, 1)).unwrap();
    engine.commit(first.id).unwrap();
    assert!(rx.try_recv().is_err());

    let second = engine.reserve(&one_core(&world, &user, 1)).unwrap();
    engine.commit(second.id).unwrap();
    let request = rx.try_recv().expect("refresh requested at zero");

    let row = usage_row(&engine, &world, &user);
    assert_eq!(row.refresh_id, Some(request.refresh_id));
    assert_eq!(row.used, 2);

    // Reservations keep flowing while the refresh is outstanding, and
    // no second token is stamped.
    let third = engine.reserve(&one_core(&world, &user, 1)).unwrap();
    engine.commit(third.id).unwrap();
    assert!(rx.try_recv().is_err());

    // A stale token is absorbed without touching the row.
    assert!(!engine
        .refresh_usage(request.usage_id, Uuid::new_v4(), 999)
        .unwrap());
    assert_eq!(usage_row(&engine, &world, &user).used, 3);

    // The authoritative count lands and the countdown restarts.
    assert!(engine
        .refresh_usage(request.usage_id, request.refresh_id, 5)
        .unwrap());
    let row = usage_row(&engine, &world, &user);
    assert_eq!(row.used, 5);
    assert_eq!(row.until_refresh, 2);
    assert_eq!(row.refresh_id, None);

    // And a duplicate of the same response is now unsolicited.
    assert!(!engine
        .refresh_usage(request.usage_id, request.refresh_id, 7)
        .unwrap());
    assert_eq!(usage_row(&engine, &world, &user).used, 5);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_task_rolls_back_expired() {
    let world = world(100);
    let engine = Arc::new(ReservationEngine::new(
        Arc::clone(&world.store),
        EngineConfig {
            reservation_ttl_secs: 0,
            until_refresh: 0,
            sweep_interval_secs: 1,
            ..EngineConfig::default()
        },
    ));
    let user = tenant_user(&world, "t1");

    let reservation = engine.reserve(&one_core(&world, &user, 4)).unwrap();
    assert_eq!(usage_row(&engine, &world, &user).reserved, 4);

    let sweeper = engine.spawn_sweeper();
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    sweeper.abort();

    assert_eq!(
        engine.reservation(reservation.id).unwrap().state,
        ReservationState::RolledBack
    );
    assert_eq!(usage_row(&engine, &world, &user).reserved, 0);
}

/// Wraps [`MemoryStore`] and fails a configurable number of usage
/// updates with `Conflict` before letting writes through.
struct FlakyStore {
    inner: MemoryStore,
    usage_conflicts: AtomicU32,
}

impl FlakyStore {
    fn new(usage_conflicts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            usage_conflicts: AtomicU32::new(usage_conflicts),
        }
    }
}

struct FlakyTx<'a> {
    inner: Box<dyn StorageTx + 'a>,
    usage_conflicts: &'a AtomicU32,
}

impl StorageTx for FlakyTx<'_> {
    fn create_service(&mut self, service: Service) -> Result<()> {
        self.inner.create_service(service)
    }
    fn create_category(&mut self, category: Category) -> Result<()> {
        self.inner.create_category(category)
    }
    fn create_resource(&mut self, resource: Resource) -> Result<()> {
        self.inner.create_resource(resource)
    }
    fn create_quota(&mut self, quota: Quota) -> Result<()> {
        self.inner.create_quota(quota)
    }
    fn update_quota(&mut self, id: Uuid, limit: Option<i64>) -> Result<()> {
        self.inner.update_quota(id, limit)
    }
    fn create_usage(&mut self, usage: Usage) -> Result<()> {
        self.inner.create_usage(usage)
    }
    fn update_usage(&mut self, id: Uuid, expected_version: u64, changes: UsageUpdate) -> Result<()> {
        let remaining = self.usage_conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.usage_conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(QuotaError::Conflict { kind: "usage" });
        }
        self.inner.update_usage(id, expected_version, changes)
    }
    fn create_reservation(&mut self, reservation: Reservation) -> Result<()> {
        self.inner.create_reservation(reservation)
    }
    fn create_reserved_item(&mut self, item: ReservedItem) -> Result<()> {
        self.inner.create_reserved_item(item)
    }
    fn transition_reservation(&mut self, id: Uuid, to: ReservationState) -> Result<bool> {
        self.inner.transition_reservation(id, to)
    }
    fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit()
    }
}

impl StoragePort for FlakyStore {
    fn begin(&self) -> Result<Box<dyn StorageTx + '_>> {
        Ok(Box::new(FlakyTx {
            inner: self.inner.begin()?,
            usage_conflicts: &self.usage_conflicts,
        }))
    }
    fn service(&self, id: Uuid) -> Result<Option<Service>> {
        self.inner.service(id)
    }
    fn service_by_name(&self, name: &str) -> Result<Option<Service>> {
        self.inner.service_by_name(name)
    }
    fn services(&self) -> Result<Vec<Service>> {
        self.inner.services()
    }
    fn category(&self, id: Uuid) -> Result<Option<Category>> {
        self.inner.category(id)
    }
    fn category_by_name(
        &self,
        service_id: Uuid,
        name: &str,
    ) -> Result<Option<Category>> {
        self.inner.category_by_name(service_id, name)
    }
    fn categories(&self, service_id: Uuid) -> Result<Vec<Category>> {
        self.inner.categories(service_id)
    }
    fn resource(&self, id: Uuid) -> Result<Option<Resource>> {
        self.inner.resource(id)
    }
    fn resource_by_name(&self, service_id: Uuid, name: &str) -> Result<Option<Resource>> {
        self.inner.resource_by_name(service_id, name)
    }
    fn resources(&self, service_id: Uuid) -> Result<Vec<Resource>> {
        self.inner.resources(service_id)
    }
    fn quota(&self, id: Uuid) -> Result<Option<Quota>> {
        self.inner.quota(id)
    }
    fn find_quota(&self, resource_id: Uuid, auth: &AuthData) -> Result<Option<Quota>> {
        self.inner.find_quota(resource_id, auth)
    }
    fn quotas(&self, resource_id: Option<Uuid>) -> Result<Vec<Quota>> {
        self.inner.quotas(resource_id)
    }
    fn usage(&self, id: Uuid) -> Result<Option<Usage>> {
        self.inner.usage(id)
    }
    fn find_usage(
        &self,
        resource_id: Uuid,
        params: &ParamData,
        auth: &AuthData,
    ) -> Result<Option<Usage>> {
        self.inner.find_usage(resource_id, params, auth)
    }
    fn usages(&self, resource_id: Option<Uuid>) -> Result<Vec<Usage>> {
        self.inner.usages(resource_id)
    }
    fn reservation(&self, id: Uuid) -> Result<Option<Reservation>> {
        self.inner.reservation(id)
    }
    fn items_for_reservation(&self, reservation_id: Uuid) -> Result<Vec<ReservedItem>> {
        self.inner.items_for_reservation(reservation_id)
    }
    fn open_reservations_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        self.inner.open_reservations_expiring_before(cutoff)
    }
    fn open_positive_total(&self, specific_name: &str) -> Result<i64> {
        self.inner.open_positive_total(specific_name)
    }
}

fn flaky_world(usage_conflicts: u32) -> (Arc<FlakyStore>, Service, SpecificResource) {
    init_tracing();
    let store = Arc::new(FlakyStore::new(usage_conflicts));
    let catalog = Catalog::new(Arc::clone(&store));
    let ctx = RequestContext::admin();

    let service = catalog
        .create_service(&ctx, "compute", field_set(["tenant_id"]))
        .unwrap();
    let category = catalog
        .create_category(
            &ctx,
            service.id,
            "per-tenant",
            field_set(["tenant_id"]),
            vec![field_set(["tenant_id"])],
        )
        .unwrap();
    let resource = catalog
        .create_resource(
            &ctx,
            service.id,
            category.id,
            "cores",
            Default::default(),
            false,
        )
        .unwrap();
    catalog
        .create_quota(&ctx, resource.id, auth(&[("tenant_id", "t1")]), Some(10))
        .unwrap();

    let cores = SpecificResource::new(&service, &resource, Default::default()).unwrap();
    (store, service, cores)
}

#[test]
fn test_transient_conflicts_are_retried() {
    let (store, service, cores) = flaky_world(2);
    let engine = ReservationEngine::new(Arc::clone(&store), config(0));
    let user = ServiceUser::new(&service, auth(&[("tenant_id", "t1")])).unwrap();

    let mut deltas = HashMap::new();
    deltas.insert(cores, 3);
    let reservation = engine.reserve(&Request::new(user, deltas)).unwrap();
    engine.commit(reservation.id).unwrap();
}

#[test]
fn test_retries_exhaust_into_transient_failure() {
    let (store, service, cores) = flaky_world(u32::MAX);
    let engine = ReservationEngine::new(Arc::clone(&store), config(0));
    let max = engine.config().max_txn_retries;
    let user = ServiceUser::new(&service, auth(&[("tenant_id", "t1")])).unwrap();

    let mut deltas = HashMap::new();
    deltas.insert(cores, 3);
    let err = engine.reserve(&Request::new(user, deltas)).unwrap_err();

    let QuotaError::TransientFailure { attempts } = err else {
        panic!("expected TransientFailure, got {err}");
    };
    assert_eq!(attempts, max + 1);
}

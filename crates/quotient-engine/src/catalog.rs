//! Service Catalog
//!
//! Administrative operations over the static configuration: which
//! services exist, how their categories key usages and quotas, and
//! which resources can be reserved.  Catalog entities are long-lived;
//! changing field sets or parameters once resources are in use is
//! unsupported.

use crate::identity::RequestContext;
use crate::model::{Category, Quota, Resource, Service, Usage};
use crate::store::StoragePort;
use quotient_common::{Audit, AuthData, FieldSet, QuotaError, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A single field change for [`Catalog::update_quota`].  Naming the
/// same field twice in one update is ambiguous and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaChange {
    /// Replace the limit; `None` makes the quota unlimited.
    Limit(Option<i64>),
}

/// Administrative facade over the catalog tables.
pub struct Catalog<S> {
    store: Arc<S>,
}

impl<S: StoragePort> Catalog<S> {
    /// Create a catalog over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Register a service and the auth fields its identities carry.
    pub fn create_service(
        &self,
        ctx: &RequestContext,
        name: &str,
        auth_fields: FieldSet,
    ) -> Result<Service> {
        if name.is_empty() {
            return Err(QuotaError::InvalidArgument("empty service name".into()));
        }

        let service = Service::new(name, auth_fields);
        let mut tx = self.store.begin()?;
        tx.create_service(service.clone())?;
        tx.commit()?;

        info!(request_id = %ctx.request_id, service = %name, "created service");
        Ok(service)
    }

    /// Service by ID.
    pub fn service(&self, id: Uuid) -> Result<Service> {
        self.store.service(id)?.ok_or(QuotaError::NotFound {
            kind: "service",
            key: id.to_string(),
        })
    }

    /// Service by unique name.
    pub fn service_by_name(&self, name: &str) -> Result<Service> {
        self.store
            .service_by_name(name)?
            .ok_or(QuotaError::NotFound {
                kind: "service",
                key: name.to_string(),
            })
    }

    /// All registered services.
    pub fn services(&self) -> Result<Vec<Service>> {
        self.store.services()
    }

    /// Create a quota category on a service.  `quota_fsets` is ordered
    /// most specific first and is normalized to terminate with the
    /// empty set (the default tier).  Every named field must be one of
    /// the service's declared auth fields.
    pub fn create_category(
        &self,
        ctx: &RequestContext,
        service_id: Uuid,
        name: &str,
        usage_fset: FieldSet,
        mut quota_fsets: Vec<FieldSet>,
    ) -> Result<Category> {
        if name.is_empty() {
            return Err(QuotaError::InvalidArgument("empty category name".into()));
        }
        let service = self.service(service_id)?;

        check_subset(&usage_fset, &service.auth_fields, "usage_fset")?;
        for fset in &quota_fsets {
            check_subset(fset, &service.auth_fields, "quota_fsets")?;
        }
        if quota_fsets.last().map_or(true, |fset| !fset.is_empty()) {
            quota_fsets.push(FieldSet::new());
        }

        let category = Category {
            id: Uuid::new_v4(),
            service_id,
            name: name.to_string(),
            usage_fset,
            quota_fsets,
            audit: Audit::new(),
        };
        let mut tx = self.store.begin()?;
        tx.create_category(category.clone())?;
        tx.commit()?;

        info!(
            request_id = %ctx.request_id,
            service = %service.name,
            category = %name,
            "created category"
        );
        Ok(category)
    }

    /// Category by ID.
    pub fn category(&self, id: Uuid) -> Result<Category> {
        self.store.category(id)?.ok_or(QuotaError::NotFound {
            kind: "category",
            key: id.to_string(),
        })
    }

    /// Category by owning service and name.
    pub fn category_by_name(&self, service_id: Uuid, name: &str) -> Result<Category> {
        self.store
            .category_by_name(service_id, name)?
            .ok_or(QuotaError::NotFound {
                kind: "category",
                key: name.to_string(),
            })
    }

    /// All categories of a service.
    pub fn categories(&self, service_id: Uuid) -> Result<Vec<Category>> {
        self.store.categories(service_id)
    }

    /// Register a resource under a service and one of its categories.
    pub fn create_resource(
        &self,
        ctx: &RequestContext,
        service_id: Uuid,
        category_id: Uuid,
        name: &str,
        params: FieldSet,
        absolute: bool,
    ) -> Result<Resource> {
        if name.is_empty() {
            return Err(QuotaError::InvalidArgument("empty resource name".into()));
        }
        let service = self.service(service_id)?;
        let category = self.category(category_id)?;
        if category.service_id != service_id {
            return Err(QuotaError::InvalidArgument(format!(
                "category {} does not belong to service {}",
                category.name, service.name
            )));
        }

        let resource = Resource {
            id: Uuid::new_v4(),
            service_id,
            category_id,
            name: name.to_string(),
            params,
            absolute,
            audit: Audit::new(),
        };
        let mut tx = self.store.begin()?;
        tx.create_resource(resource.clone())?;
        tx.commit()?;

        info!(
            request_id = %ctx.request_id,
            service = %service.name,
            resource = %name,
            absolute,
            "created resource"
        );
        Ok(resource)
    }

    /// Resource by ID.
    pub fn resource(&self, id: Uuid) -> Result<Resource> {
        self.store.resource(id)?.ok_or(QuotaError::NotFound {
            kind: "resource",
            key: id.to_string(),
        })
    }

    /// Resource by owning service and name.
    pub fn resource_by_name(&self, service_id: Uuid, name: &str) -> Result<Resource> {
        self.store
            .resource_by_name(service_id, name)?
            .ok_or(QuotaError::NotFound {
                kind: "resource",
                key: name.to_string(),
            })
    }

    /// All resources of a service.
    pub fn resources(&self, service_id: Uuid) -> Result<Vec<Resource>> {
        self.store.resources(service_id)
    }

    /// Create a quota limit for a resource and an auth-data match.
    /// Fields outside the service's declared auth fields are dropped
    /// before the row is stored, so duplicate detection runs on the
    /// exact projection the matcher will later compare against.
    pub fn create_quota(
        &self,
        ctx: &RequestContext,
        resource_id: Uuid,
        auth_data: AuthData,
        limit: Option<i64>,
    ) -> Result<Quota> {
        let resource = self.resource(resource_id)?;
        let service = self.service(resource.service_id)?;
        let filtered: AuthData = auth_data
            .into_iter()
            .filter(|(k, _)| service.auth_fields.contains(k.as_str()))
            .collect();

        let quota = Quota::new(resource_id, filtered, limit);
        let mut tx = self.store.begin()?;
        tx.create_quota(quota.clone())?;
        tx.commit()?;

        info!(
            request_id = %ctx.request_id,
            resource = %resource.name,
            limit = ?limit,
            "created quota"
        );
        Ok(quota)
    }

    /// Quota by ID.
    pub fn quota(&self, id: Uuid) -> Result<Quota> {
        self.store.quota(id)?.ok_or(QuotaError::NotFound {
            kind: "quota",
            key: id.to_string(),
        })
    }

    /// Quota whose stored auth data equals `auth` exactly.  This is a
    /// point lookup, not tiered resolution; the engine resolves tiers.
    pub fn find_quota(&self, resource_id: Uuid, auth: &AuthData) -> Result<Quota> {
        self.store
            .find_quota(resource_id, auth)?
            .ok_or(QuotaError::NotFound {
                kind: "quota",
                key: resource_id.to_string(),
            })
    }

    /// Quotas, optionally filtered by resource.
    pub fn quotas(&self, resource_id: Option<Uuid>) -> Result<Vec<Quota>> {
        self.store.quotas(resource_id)
    }

    /// Apply a list of field changes to a quota.  A list naming the
    /// same field more than once is rejected with `AmbiguousUpdate`
    /// and nothing is applied.
    pub fn update_quota(
        &self,
        ctx: &RequestContext,
        quota_id: Uuid,
        changes: &[QuotaChange],
    ) -> Result<Quota> {
        let mut limit: Option<Option<i64>> = None;
        for change in changes {
            match change {
                QuotaChange::Limit(value) => {
                    if limit.is_some() {
                        return Err(QuotaError::AmbiguousUpdate {
                            field: "limit".into(),
                        });
                    }
                    limit = Some(*value);
                }
            }
        }

        let mut quota = self.quota(quota_id)?;
        if let Some(value) = limit {
            let mut tx = self.store.begin()?;
            tx.update_quota(quota_id, value)?;
            tx.commit()?;
            quota.limit = value;
            quota.audit.touch();
            info!(request_id = %ctx.request_id, quota = %quota_id, limit = ?value, "updated quota");
        }
        Ok(quota)
    }

    /// Usage row by ID.  Read-only introspection; rows are
    /// materialized by the engine.
    pub fn usage(&self, id: Uuid) -> Result<Usage> {
        self.store.usage(id)?.ok_or(QuotaError::NotFound {
            kind: "usage",
            key: id.to_string(),
        })
    }

    /// Usage rows, optionally filtered by resource.
    pub fn usages(&self, resource_id: Option<Uuid>) -> Result<Vec<Usage>> {
        self.store.usages(resource_id)
    }
}

fn check_subset(fset: &FieldSet, auth_fields: &FieldSet, what: &str) -> Result<()> {
    let unknown: Vec<_> = fset.difference(auth_fields).cloned().collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(QuotaError::InvalidArgument(format!(
            "{what} names fields outside the service's auth fields: {}",
            unknown.join(", ")
        )))
    }
}

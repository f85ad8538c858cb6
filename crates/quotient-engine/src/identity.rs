//! Caller Identity
//!
//! The engine never authenticates callers or interprets auth fields;
//! it only filters and projects the flat auth-data map a service
//! supplies on behalf of its user.

use crate::model::{Service, SpecificResource};
use quotient_common::{AuthData, FieldSet, QuotaError, Result};
use std::collections::HashMap;
use uuid::Uuid;

/// Generate a unique request ID for log correlation.
pub fn generate_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// A user of a registered service: the service plus the auth data
/// identifying the user on it.  Fields outside the service's declared
/// `auth_fields` are dropped; a missing declared field is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUser {
    /// The service acting on the user's behalf.
    pub service_id: Uuid,
    /// Auth data filtered to the service's declared fields.
    pub auth_data: AuthData,
}

impl ServiceUser {
    /// Bind auth data to a service.
    pub fn new(service: &Service, auth_data: AuthData) -> Result<Self> {
        let filtered: AuthData = auth_data
            .into_iter()
            .filter(|(k, _)| service.auth_fields.contains(k.as_str()))
            .collect();

        let supplied: FieldSet = filtered.keys().cloned().collect();
        let missing: Vec<_> = service.auth_fields.difference(&supplied).cloned().collect();
        if !missing.is_empty() {
            return Err(QuotaError::InvalidArgument(format!(
                "missing auth data fields: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            service_id: service.id,
            auth_data: filtered,
        })
    }
}

/// A resource reservation request: who is reserving, and how much of
/// what.
#[derive(Debug, Clone)]
pub struct Request {
    /// The identity the reservation is for.
    pub svc_user: ServiceUser,
    /// Requested delta per specific resource; negative deltas
    /// represent deallocation.
    pub deltas: HashMap<SpecificResource, i64>,
    /// Unique ID for log correlation across services.
    pub request_id: String,
}

impl Request {
    /// Build a request with a generated request ID.
    pub fn new(svc_user: ServiceUser, deltas: HashMap<SpecificResource, i64>) -> Self {
        Self {
            svc_user,
            deltas,
            request_id: generate_request_id(),
        }
    }

    /// Build a request carrying a caller-supplied request ID.
    pub fn with_request_id(
        svc_user: ServiceUser,
        deltas: HashMap<SpecificResource, i64>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            svc_user,
            deltas,
            request_id: request_id.into(),
        }
    }
}

/// Security context for administrative catalog operations.  Carried
/// for log correlation; the engine does not authorize with it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// ID of the acting user, if known.
    pub user: Option<String>,
    /// Tenant of the acting user, if known.
    pub tenant: Option<String>,
    /// Roles of the acting user.
    pub roles: Vec<String>,
    /// Unique request ID.
    pub request_id: String,
    /// Whether the context carries administrative access.
    pub is_admin: bool,
}

impl RequestContext {
    /// Create a context; `is_admin` derives from the roles.
    pub fn new(user: Option<String>, tenant: Option<String>, roles: Vec<String>) -> Self {
        let is_admin = roles.iter().any(|r| r.eq_ignore_ascii_case("admin"));
        Self {
            user,
            tenant,
            roles,
            request_id: generate_request_id(),
            is_admin,
        }
    }

    /// A generic administrative context.
    pub fn admin() -> Self {
        Self::new(None, None, vec!["admin".into()])
    }

    /// A copy of this context with admin privileges.
    pub fn elevated(&self) -> Self {
        let mut ctx = self.clone();
        ctx.is_admin = true;
        if !ctx.roles.iter().any(|r| r.eq_ignore_ascii_case("admin")) {
            ctx.roles.push("admin".into());
        }
        ctx
    }
}

//! Quotient - Multi-tenant resource quota and reservation engine
//!
//! Services register their resources and the identity fields their
//! callers carry; the engine tracks consumption per caller and grants
//! or denies reservations against configurable limits.  Reservations
//! are two-phase: a successful `reserve` holds the requested amounts
//! provisionally until the caller commits or rolls back, and abandoned
//! reservations are rolled back by a periodic expiration sweep.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RESERVATION ENGINE                      │
//! │        reserve → commit | rollback | expiration sweep        │
//! └──────┬──────────────────────┬─────────────────────┬──────────┘
//!        │                      │                     │
//! ┌──────▼──────┐      ┌────────▼────────┐   ┌────────▼────────┐
//! │   CATALOG   │      │ FIELD-SET       │   │  USAGE LEDGER   │
//! │  services   │      │ MATCHER         │   │  used/reserved  │
//! │  categories │      │ auth projection │   │  refresh tokens │
//! │  resources  │      │ quota tiers     │   │                 │
//! └──────┬──────┘      └────────┬────────┘   └────────┬────────┘
//!        │                      │                     │
//! ┌──────▼──────────────────────▼─────────────────────▼──────────┐
//! │                        STORAGE PORT                          │
//! │     typed reads + transactional writes, backend-agnostic     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod engine;
pub mod identity;
pub mod ledger;
pub mod matcher;
pub mod memory;
pub mod model;
pub mod store;

pub use catalog::{Catalog, QuotaChange};
pub use engine::ReservationEngine;
pub use identity::{Request, RequestContext, ServiceUser};
pub use ledger::RefreshRequest;
pub use memory::MemoryStore;
pub use model::{
    Category, Quota, Reservation, ReservationState, ReservedItem, Resource, Service,
    SpecificResource, Usage,
};
pub use store::{StoragePort, StorageTx, UsageUpdate};

pub use quotient_common::{
    field_set, project, Audit, AuthData, EngineConfig, FieldSet, Overage, ParamData, QuotaError,
    Result,
};

//! Tenant controller
//!
//! Watches Tenant objects, turns changes into queued keys, and reconciles
//! each key against this node's IPAM state with a small pool of workers.
//! A key is never reconciled by two workers at once.

mod events;
mod runner;
mod tenant;

pub use events::{watch_tenants, EventTranslator, ReconcileEvent};
pub use runner::TenantController;
pub use tenant::{
    reconcile, ClusterApi, Context, KubeClusterApi, ReconcileOutcome, TenantLister,
    FIELD_MANAGER,
};

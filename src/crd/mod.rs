//! Custom Resource Definitions for the tenant CNI
//!
//! This module contains the Tenant CRD watched by the node agent.

mod tenant;

pub use tenant::{Tenant, TenantKey, TenantNode, TenantSpec, TenantStatus};

//! tenantcni - per-node tenant IPAM for a multi-tenant Kubernetes CNI
//!
//! Every node runs one agent. The agent carves its node pod CIDR into
//! fixed-size subnets, hands one to each Tenant that lists the node as a
//! member, and records the claim on disk, on the Node (as a label) and in the
//! Tenant status.
//!
//! # Modules
//!
//! - [`ipam`] - CIDR partitioning, the crash-safe node store and the
//!   allocation protocol
//! - [`queue`] - deduplicating reconcile queue with per-key exclusion
//! - [`crd`] - the Tenant custom resource
//! - [`controller`] - watch, reconcile and worker pool
//! - [`bootstrap`] - node discovery, store seeding, default tenant
//! - [`config`] - configuration values and defaults
//! - [`retry`] - backoff schedule
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod ipam;
pub mod queue;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

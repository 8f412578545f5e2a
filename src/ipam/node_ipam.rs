//! Tenant-facing allocation protocol on top of [`NodeStore`].

use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, info};

use super::store::{NodeRecord, NodeStore};
use crate::{Error, Result};

/// Allocates tenant subnets from one node's pool.
///
/// Every operation goes through the store lock, so calls from any number of
/// workers are linearizable without extra synchronization.
#[derive(Clone, Debug)]
pub struct NodeIpam {
    store: Arc<NodeStore>,
}

impl NodeIpam {
    /// Wrap a store
    pub fn new(store: Arc<NodeStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Subnet for `tenant`, claiming the lowest available one on first call.
    ///
    /// Idempotent: a tenant that already holds a subnet gets it back and the
    /// pool is not touched.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when nothing is left, [`Error::Persistence`]
    /// when the claim could not be written (the claim is then not made).
    pub fn allocate(&self, tenant: &str) -> Result<Ipv4Net> {
        self.allocate_exclusive(tenant, |_| false)
    }

    /// Like [`allocate`](Self::allocate), but refuses a first claim while any
    /// other tenant for which `clashes` returns true holds a subnet.
    ///
    /// The check and the claim happen under one store lock, so two clashing
    /// tenants racing on different workers can never both win.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] naming the holder, plus everything
    /// [`allocate`](Self::allocate) returns.
    pub fn allocate_exclusive(
        &self,
        tenant: &str,
        clashes: impl Fn(&str) -> bool,
    ) -> Result<Ipv4Net> {
        let node = self.store.node_name().to_string();
        let (subnet, claimed) = self.store.update(|record| {
            if let Some(held) = record.allocations.get(tenant) {
                return Ok((*held, false));
            }
            if let Some(holder) = record
                .allocations
                .keys()
                .find(|holder| holder.as_str() != tenant && clashes(holder))
            {
                return Err(Error::conflict(
                    tenant,
                    format!("clashes with {holder}, which already holds a subnet"),
                ));
            }
            let next = record
                .available_subnets
                .first()
                .copied()
                .ok_or_else(|| Error::PoolExhausted {
                    node: node.clone(),
                    tenant: tenant.to_string(),
                })?;
            record.reserve(tenant, next)?;
            Ok((next, true))
        })?;

        if claimed {
            info!(tenant = %tenant, subnet = %subnet, "allocated tenant subnet");
        } else {
            debug!(tenant = %tenant, subnet = %subnet, "tenant already holds subnet");
        }
        Ok(subnet)
    }

    /// Give `tenant`'s subnet back to the pool.
    pub fn release(&self, tenant: &str) -> Result<Ipv4Net> {
        let subnet = self.store.release(tenant)?;
        info!(tenant = %tenant, subnet = %subnet, "released tenant subnet");
        Ok(subnet)
    }

    /// Subnet held by `tenant`, or [`Error::NotFound`].
    pub fn lookup(&self, tenant: &str) -> Result<Ipv4Net> {
        self.store
            .lookup(tenant)
            .ok_or_else(|| Error::not_found(tenant))
    }

    /// Number of subnets still available
    pub fn available(&self) -> usize {
        self.store.snapshot().available_subnets.len()
    }

    /// Copy of the node record
    pub fn snapshot(&self) -> NodeRecord {
        self.store.snapshot()
    }
}

//! Tenant reconciliation
//!
//! Each pass re-reads the tenant from the local cache and converges this
//! node's allocation on it:
//!
//! - tenant gone, or this node not in its node list → drop the node label,
//!   release the subnet, clear this node from the tenant status
//! - this node is a member → allocate (idempotent), label the node
//!   `<domain>.<plugin>.<tenant>=Enabled`, record the subnet in status
//!
//! No per-tenant state is kept between passes; the event that triggered a
//! pass is never consulted.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::config::{ControllerConfig, LabelConfig, TENANT_ENABLED};
use crate::crd::{Tenant, TenantKey};
use crate::error::from_kube_write;
use crate::ipam::NodeIpam;
use crate::Error;

/// Field manager used for writes made by this agent
pub const FIELD_MANAGER: &str = "tenantcni-controller";

/// Read access to the locally cached Tenant objects
#[cfg_attr(test, automock)]
pub trait TenantLister: Send + Sync {
    /// Current cached object for `key`, if it exists
    fn get(&self, key: &TenantKey) -> Option<Arc<Tenant>>;

    /// Keys of every cached tenant
    fn keys(&self) -> Vec<TenantKey>;
}

impl TenantLister for Store<Tenant> {
    fn get(&self, key: &TenantKey) -> Option<Arc<Tenant>> {
        let mut obj_ref = ObjectRef::<Tenant>::new(key.name());
        if let Some(ns) = key.namespace() {
            obj_ref = obj_ref.within(ns);
        }
        Store::get(self, &obj_ref)
    }

    fn keys(&self) -> Vec<TenantKey> {
        self.state().iter().map(|t| TenantKey::of(t)).collect()
    }
}

/// Writes against the API server, guarded by resource versions
///
/// A write based on a stale object fails with [`Error::VersionConflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch the current Node object
    async fn get_node(&self, name: &str) -> Result<Node, Error>;

    /// Replace a Node, failing if it changed since it was read
    async fn replace_node(&self, node: &Node) -> Result<Node, Error>;

    /// Set (`Some`) or remove (`None`) `status.allocations[node]` on `tenant`,
    /// failing if the tenant changed since it was cached
    async fn patch_tenant_allocation(
        &self,
        tenant: &Tenant,
        node: &str,
        subnet: Option<Ipv4Net>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_node(&self, name: &str) -> Result<Node, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node, Error> {
        let name = node.name_any();
        let api: Api<Node> = Api::all(self.client.clone());
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&name, &params, node)
            .await
            .map_err(|e| from_kube_write("Node", &name, e))
    }

    async fn patch_tenant_allocation(
        &self,
        tenant: &Tenant,
        node: &str,
        subnet: Option<Ipv4Net>,
    ) -> Result<(), Error> {
        let name = tenant.name_any();
        let api: Api<Tenant> = match tenant.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        };

        // A null value deletes the key under JSON merge patch
        let mut allocations = serde_json::Map::new();
        allocations.insert(
            node.to_string(),
            subnet.map_or(Value::Null, |s| Value::String(s.to_string())),
        );
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": tenant.resource_version() },
            "status": { "allocations": allocations }
        });

        api.patch_status(
            &name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| from_kube_write("Tenant", &name, e))?;

        Ok(())
    }
}

/// Shared state for every reconcile pass
pub struct Context {
    /// Node this agent manages
    pub node_name: String,
    /// Allocation protocol for this node
    pub ipam: NodeIpam,
    /// Local cache of Tenant objects
    pub tenants: Arc<dyn TenantLister>,
    /// API server writes
    pub api: Arc<dyn ClusterApi>,
    /// Node label naming
    pub labels: LabelConfig,
    /// Deadline for each API call
    pub api_timeout: Duration,
}

impl Context {
    /// Build a context from controller configuration
    pub fn new(
        config: &ControllerConfig,
        ipam: NodeIpam,
        tenants: Arc<dyn TenantLister>,
        api: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            node_name: config.node_name.clone(),
            ipam,
            tenants,
            api,
            labels: config.labels.clone(),
            api_timeout: config.api_timeout,
        }
    }
}

/// Result of a successful reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Node is a member; the tenant holds this subnet
    Allocated(Ipv4Net),
    /// Node left the tenant (or the tenant was deleted); this subnet was freed
    Released(Ipv4Net),
    /// Nothing held and nothing wanted on this node
    Skipped,
}

/// Converge this node's allocation for the tenant identified by `key`.
///
/// Allocations are held under the full `namespace/name` key. The node label
/// only carries the name, so while one namespace's tenant holds a subnet a
/// same-named tenant from another namespace fails with [`Error::Conflict`]
/// and is left alone until the holder lets go.
#[instrument(skip(ctx), fields(tenant = %key, node = %ctx.node_name))]
pub async fn reconcile(key: &TenantKey, ctx: &Context) -> Result<ReconcileOutcome, Error> {
    let Some(tenant) = ctx.tenants.get(key) else {
        debug!("tenant not in cache, treating as deleted");
        return withdraw(key, None, ctx).await;
    };

    if !tenant.spec.includes_node(&ctx.node_name) {
        debug!("node is not a member of tenant");
        return withdraw(key, Some(&tenant), ctx).await;
    }

    // Checked before claiming so a label the API would refuse takes no subnet
    let label = ctx.labels.checked_key_for(key.name())?;
    let subnet = ctx
        .ipam
        .allocate_exclusive(&key.to_string(), |holder| shares_label(ctx, holder, &label))?;
    set_node_label(ctx, &label, true).await?;
    record_allocation(ctx, &tenant, Some(subnet)).await?;

    Ok(ReconcileOutcome::Allocated(subnet))
}

/// Whether the allocation held under `holder` maps to node label `label`
fn shares_label(ctx: &Context, holder: &str, label: &str) -> bool {
    holder
        .parse::<TenantKey>()
        .is_ok_and(|held| ctx.labels.key_for(held.name()) == label)
}

/// Remove this node from the tenant
async fn withdraw(
    key: &TenantKey,
    tenant: Option<&Tenant>,
    ctx: &Context,
) -> Result<ReconcileOutcome, Error> {
    let id = key.to_string();
    let outcome = match ctx.ipam.lookup(&id) {
        Ok(_) => {
            // Label goes first so the data path stops using the subnet before
            // it can be handed to someone else
            set_node_label(ctx, &ctx.labels.key_for(key.name()), false).await?;
            let subnet = ctx.ipam.release(&id)?;
            ReconcileOutcome::Released(subnet)
        }
        Err(Error::NotFound { .. }) => ReconcileOutcome::Skipped,
        Err(e) => return Err(e),
    };

    if let Some(tenant) = tenant {
        record_allocation(ctx, tenant, None).await?;
    }

    Ok(outcome)
}

/// Add or remove a tenant label on this node
async fn set_node_label(ctx: &Context, key: &str, enabled: bool) -> Result<(), Error> {
    let mut node = with_timeout(ctx, "get node", ctx.api.get_node(&ctx.node_name)).await?;

    let labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
    let changed = if enabled {
        labels
            .insert(key.to_string(), TENANT_ENABLED.to_string())
            .as_deref()
            != Some(TENANT_ENABLED)
    } else {
        labels.remove(key).is_some()
    };

    if !changed {
        debug!(label = %key, enabled, "node label already up to date");
        return Ok(());
    }

    with_timeout(ctx, "update node", ctx.api.replace_node(&node)).await?;
    info!(label = %key, enabled, "updated node label");
    Ok(())
}

/// Reflect this node's subnet in the tenant status
async fn record_allocation(
    ctx: &Context,
    tenant: &Tenant,
    subnet: Option<Ipv4Net>,
) -> Result<(), Error> {
    let desired = subnet.map(|s| s.to_string());
    if tenant.allocation_for(&ctx.node_name) == desired.as_deref() {
        return Ok(());
    }

    with_timeout(
        ctx,
        "patch tenant status",
        ctx.api
            .patch_tenant_allocation(tenant, &ctx.node_name, subnet),
    )
    .await?;
    debug!(subnet = ?desired, "updated tenant status");
    Ok(())
}

async fn with_timeout<T>(
    ctx: &Context,
    operation: &str,
    call: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(ctx.api_timeout, call)
        .await
        .map_err(|_| Error::Timeout {
            operation: operation.to_string(),
            after: ctx.api_timeout,
        })?
}

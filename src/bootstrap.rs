//! Node agent startup
//!
//! Everything that happens once before the controller starts: figuring out
//! which node this agent runs on, opening and seeding that node's store,
//! installing the Tenant CRD and registering the default tenant.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::NodeStoreConfig;
use crate::controller::FIELD_MANAGER;
use crate::crd::{Tenant, TenantSpec};
use crate::ipam::{parse_cidr, partition, subnet_count, NodeIpam, NodeStore};
use crate::{Error, Result};

/// Name of the tenant registered at startup
pub const DEFAULT_TENANT: &str = "default";

/// Namespace of the default tenant
pub const DEFAULT_TENANT_NAMESPACE: &str = "default";

/// Node identity as handed to the agent by the downward API
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeEnv {
    /// `MY_NODE_NAME`
    pub node_name: Option<String>,
    /// `MY_POD_NAME`
    pub pod_name: Option<String>,
    /// `MY_POD_NAMESPACE`
    pub pod_namespace: Option<String>,
    /// `MY_NODE_IP`
    pub node_ip: Option<String>,
}

/// Resolved identity of the node this agent manages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Kubernetes node name
    pub name: String,
    /// Node IP
    pub ip: IpAddr,
    /// Pod CIDR the node's tenant subnets are carved from
    pub cidr: Ipv4Net,
}

/// API calls needed during startup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterBootstrap: Send + Sync {
    /// Node a pod is scheduled on, `None` while unscheduled
    async fn pod_node_name(&self, namespace: &str, pod: &str) -> Result<Option<String>>;

    /// Fetch a Node
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Names of every node in the cluster
    async fn list_node_names(&self) -> Result<Vec<String>>;

    /// Create or update the Tenant CRD
    async fn install_crd(&self) -> Result<()>;

    /// Create `tenant`. Returns `false` if it already exists.
    async fn create_tenant(&self, tenant: &Tenant) -> Result<bool>;
}

/// Real Kubernetes client implementation
pub struct KubeBootstrap {
    client: Client,
}

impl KubeBootstrap {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterBootstrap for KubeBootstrap {
    async fn pod_node_name(&self, namespace: &str, pod: &str) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api.get(pod).await?;
        Ok(pod.spec.and_then(|s| s.node_name))
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn list_node_names(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(|n| n.name_any()).collect())
    }

    async fn install_crd(&self) -> Result<()> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        crds.patch(
            "tenants.jovik31.dev",
            &params,
            &Patch::Apply(&Tenant::crd()),
        )
        .await?;
        Ok(())
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<bool> {
        let ns = tenant
            .namespace()
            .unwrap_or_else(|| DEFAULT_TENANT_NAMESPACE.to_string());
        let api: Api<Tenant> = Api::namespaced(self.client.clone(), &ns);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.create(&params, tenant).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Name of the node this agent runs on.
///
/// `MY_NODE_NAME` wins. Without it the node is derived from where this pod
/// is scheduled, and that derived name is the one returned.
pub async fn resolve_node_name(env: &NodeEnv, api: &dyn ClusterBootstrap) -> Result<String> {
    if let Some(name) = env.node_name.as_deref().filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }

    let (Some(namespace), Some(pod)) = (env.pod_namespace.as_deref(), env.pod_name.as_deref())
    else {
        return Err(Error::config(
            "node name unknown: set MY_NODE_NAME, or MY_POD_NAME and MY_POD_NAMESPACE",
        ));
    };

    match api.pod_node_name(namespace, pod).await? {
        Some(node) => {
            debug!(pod = %pod, node = %node, "derived node name from pod");
            Ok(node)
        }
        None => Err(Error::config(format!(
            "pod {namespace}/{pod} is not scheduled to a node yet"
        ))),
    }
}

/// Node IP: `MY_NODE_IP`, else the node's InternalIP address
pub fn resolve_node_ip(env: &NodeEnv, node: &Node) -> Result<IpAddr> {
    if let Some(ip) = env.node_ip.as_deref().filter(|ip| !ip.is_empty()) {
        return ip
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid MY_NODE_IP '{ip}': {e}")));
    }

    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .ok_or_else(|| Error::config(format!("node {} has no InternalIP", node.name_any())))
        .and_then(|addr| {
            addr.address
                .parse()
                .map_err(|e| Error::config(format!("invalid node address '{}': {e}", addr.address)))
        })
}

/// The node's IPv4 pod CIDR
pub fn resolve_node_cidr(node: &Node) -> Result<Ipv4Net> {
    let spec = node.spec.as_ref();
    let cidr = spec.and_then(|s| s.pod_cidr.clone()).or_else(|| {
        spec.and_then(|s| s.pod_cidrs.as_ref())
            .and_then(|all| all.iter().find(|c| !c.contains(':')).cloned())
    });

    match cidr {
        Some(cidr) => parse_cidr(&cidr),
        None => Err(Error::config(format!(
            "node {} has no pod CIDR assigned",
            node.name_any()
        ))),
    }
}

/// Resolve name, IP and pod CIDR of this node
pub async fn discover_node(env: &NodeEnv, api: &dyn ClusterBootstrap) -> Result<NodeIdentity> {
    let name = resolve_node_name(env, api).await?;
    let node = api.get_node(&name).await?;
    let identity = NodeIdentity {
        ip: resolve_node_ip(env, &node)?,
        cidr: resolve_node_cidr(&node)?,
        name,
    };
    info!(
        node = %identity.name,
        ip = %identity.ip,
        cidr = %identity.cidr,
        "discovered node identity"
    );
    Ok(identity)
}

/// Open this node's store and make sure its pool is seeded.
///
/// The first start partitions the node CIDR at `prefix_len`. Later starts
/// keep whatever pool and allocations are on disk; a different `prefix_len`
/// is logged and otherwise ignored since live allocations depend on the old
/// layout.
pub fn prepare_ipam(
    config: &NodeStoreConfig,
    identity: &NodeIdentity,
    prefix_len: u8,
) -> Result<NodeIpam> {
    let store = NodeStore::open(config, &identity.name)?;
    store.set_node_ip(identity.ip)?;
    store.set_node_cidr(identity.cidr)?;

    // Validates the prefix without building the pool
    let count = subnet_count(identity.cidr, prefix_len)?;

    let record = store.snapshot();
    if record.is_empty() {
        debug!(node = %identity.name, subnets = count, "partitioning node CIDR");
        store.set_available_pool(partition(identity.cidr, prefix_len)?)?;
    } else {
        info!(
            node = %identity.name,
            available = record.available_subnets.len(),
            allocated = record.allocations.len(),
            "restored persisted node state"
        );
        if let Some(persisted) = record.subnet_prefix.filter(|p| *p != prefix_len) {
            warn!(
                node = %identity.name,
                persisted,
                configured = prefix_len,
                "subnet prefix differs from persisted pool, keeping persisted pool"
            );
        }
    }

    Ok(NodeIpam::new(Arc::new(store)))
}

/// Tenant `default/default` spanning the given nodes
pub fn default_tenant<I, S>(nodes: I) -> Tenant
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tenant = Tenant::new(DEFAULT_TENANT, TenantSpec::with_nodes(nodes));
    tenant.metadata.namespace = Some(DEFAULT_TENANT_NAMESPACE.to_string());
    tenant
}

/// Create the default tenant over every current node unless it exists.
///
/// Returns whether it was created.
pub async fn register_default_tenant(api: &dyn ClusterBootstrap) -> Result<bool> {
    let nodes = api.list_node_names().await?;
    let count = nodes.len();
    let created = api.create_tenant(&default_tenant(nodes)).await?;
    if created {
        info!(nodes = count, "registered default tenant");
    } else {
        debug!("default tenant already exists");
    }
    Ok(created)
}

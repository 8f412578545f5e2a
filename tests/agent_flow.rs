//! Agent flow tests without an API server
//!
//! Watch events go through the real translator and reflector cache, keys go
//! through the real queue, and reconciles run against an in-memory cluster
//! that enforces resource versions like the API server does.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use parking_lot::Mutex;
use tempfile::TempDir;

use tenantcni::bootstrap::{prepare_ipam, NodeIdentity};
use tenantcni::config::{ControllerConfig, NodeStoreConfig};
use tenantcni::controller::{
    reconcile, ClusterApi, Context, EventTranslator, ReconcileOutcome, TenantLister,
};
use tenantcni::crd::{Tenant, TenantKey, TenantSpec, TenantStatus};
use tenantcni::queue::ReconcileQueue;
use tenantcni::retry::BackoffConfig;
use tenantcni::Error;

const NODE: &str = "worker-1";

// =============================================================================
// In-memory cluster
// =============================================================================

#[derive(Default)]
struct MemoryCluster {
    node: Mutex<Node>,
    statuses: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryCluster {
    fn new() -> Self {
        let cluster = Self::default();
        *cluster.node.lock() = Node {
            metadata: ObjectMeta {
                name: Some(NODE.to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        cluster
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.node.lock().metadata.labels.clone().unwrap_or_default()
    }

    fn status_of(&self, tenant: &str) -> BTreeMap<String, String> {
        self.statuses
            .lock()
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_node(&self, _name: &str) -> Result<Node, Error> {
        Ok(self.node.lock().clone())
    }

    async fn replace_node(&self, node: &Node) -> Result<Node, Error> {
        let mut current = self.node.lock();
        if current.metadata.resource_version != node.metadata.resource_version {
            return Err(Error::VersionConflict {
                kind: "Node",
                name: node.name_any(),
            });
        }
        let next: u64 = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;
        let mut updated = node.clone();
        updated.metadata.resource_version = Some(next.to_string());
        *current = updated.clone();
        Ok(updated)
    }

    async fn patch_tenant_allocation(
        &self,
        tenant: &Tenant,
        node: &str,
        subnet: Option<Ipv4Net>,
    ) -> Result<(), Error> {
        let mut statuses = self.statuses.lock();
        let entry = statuses.entry(TenantKey::of(tenant).to_string()).or_default();
        match subnet {
            Some(subnet) => entry.insert(node.to_string(), subnet.to_string()),
            None => entry.remove(node),
        };
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Agent {
    translator: EventTranslator,
    queue: ReconcileQueue<TenantKey>,
    ctx: Context,
    cluster: Arc<MemoryCluster>,
}

impl Agent {
    fn start(dir: &TempDir) -> Self {
        let identity = NodeIdentity {
            name: NODE.to_string(),
            ip: "192.168.1.10".parse().unwrap(),
            cidr: "10.244.0.0/22".parse().unwrap(),
        };
        let ipam = prepare_ipam(&NodeStoreConfig::new(dir.path()), &identity, 24).unwrap();

        let (translator, store) = EventTranslator::new();
        let cluster = Arc::new(MemoryCluster::new());
        let config = ControllerConfig::new(NODE);
        let ctx = Context::new(
            &config,
            ipam,
            Arc::new(store) as Arc<dyn TenantLister>,
            cluster.clone(),
        );
        Self {
            translator,
            queue: ReconcileQueue::new(BackoffConfig::default()),
            ctx,
            cluster,
        }
    }

    fn observe(&mut self, event: Event<Tenant>) {
        for change in self.translator.translate(event) {
            self.queue.add(change.key());
        }
    }

    /// Reconcile every queued key once
    async fn drain(&self) -> Vec<(TenantKey, ReconcileOutcome)> {
        let mut outcomes = Vec::new();
        while !self.queue.is_empty() {
            let item = tokio::time::timeout(Duration::from_secs(1), self.queue.get())
                .await
                .unwrap()
                .unwrap();
            let key = item.key().clone();
            let outcome = reconcile(&key, &self.ctx).await.unwrap();
            item.finish();
            outcomes.push((key, outcome));
        }
        outcomes
    }
}

fn tenant(name: &str, version: &str, nodes: &[&str]) -> Tenant {
    tenant_in("default", name, version, nodes)
}

fn tenant_in(namespace: &str, name: &str, version: &str, nodes: &[&str]) -> Tenant {
    let mut t = Tenant::new(name, TenantSpec::with_nodes(nodes.iter().copied()));
    t.metadata.namespace = Some(namespace.to_string());
    t.metadata.resource_version = Some(version.to_string());
    t
}

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn initial_list_allocates_member_tenants_only() {
    let dir = TempDir::new().unwrap();
    let mut agent = Agent::start(&dir);

    agent.observe(Event::Init);
    agent.observe(Event::InitApply(tenant("blue", "1", &[NODE, "worker-2"])));
    agent.observe(Event::InitApply(tenant("red", "2", &["worker-2"])));
    agent.observe(Event::InitApply(tenant("green", "3", &[NODE])));
    agent.observe(Event::InitDone);

    let outcomes: BTreeMap<_, _> = agent
        .drain()
        .await
        .into_iter()
        .map(|(k, o)| (k.name().to_string(), o))
        .collect();

    assert_eq!(outcomes["blue"], ReconcileOutcome::Allocated(net("10.244.0.0/24")));
    assert_eq!(outcomes["green"], ReconcileOutcome::Allocated(net("10.244.1.0/24")));
    assert_eq!(outcomes["red"], ReconcileOutcome::Skipped);

    let labels = agent.cluster.labels();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels["jovik31.dev.tenantcni.blue"], "Enabled");
    assert_eq!(
        agent.cluster.status_of("default/blue").get(NODE).map(String::as_str),
        Some("10.244.0.0/24")
    );
}

#[tokio::test]
async fn membership_change_releases_and_second_pass_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let mut agent = Agent::start(&dir);

    agent.observe(Event::Apply(tenant("blue", "1", &[NODE])));
    agent.drain().await;
    assert!(agent.ctx.ipam.lookup("default/blue").is_ok());

    // The cached copy carries the status this agent wrote earlier
    let mut shrunk = tenant("blue", "2", &["worker-2"]);
    shrunk.status = Some(TenantStatus {
        allocations: agent.cluster.status_of("default/blue"),
    });
    agent.observe(Event::Apply(shrunk));
    let outcomes = agent.drain().await;
    assert_eq!(
        outcomes[0].1,
        ReconcileOutcome::Released(net("10.244.0.0/24"))
    );
    assert!(agent.cluster.labels().is_empty());
    assert!(agent.cluster.status_of("default/blue").is_empty());

    let node_version = agent.cluster.node.lock().metadata.resource_version.clone();
    agent.queue.add(TenantKey::new("default", "blue"));
    let outcomes = agent.drain().await;
    assert_eq!(outcomes[0].1, ReconcileOutcome::Skipped);
    assert_eq!(
        agent.cluster.node.lock().metadata.resource_version,
        node_version
    );
}

#[tokio::test]
async fn deletion_missed_during_disconnect_is_caught_on_relist() {
    let dir = TempDir::new().unwrap();
    let mut agent = Agent::start(&dir);

    agent.observe(Event::Apply(tenant("blue", "1", &[NODE])));
    agent.observe(Event::Apply(tenant("red", "2", &[NODE])));
    agent.drain().await;
    assert_eq!(agent.ctx.ipam.available(), 2);

    // Watch reconnects; red vanished meanwhile
    agent.observe(Event::Init);
    agent.observe(Event::InitApply(tenant("blue", "1", &[NODE])));
    agent.observe(Event::InitDone);
    let outcomes = agent.drain().await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, TenantKey::new("default", "red"));
    assert_eq!(
        outcomes[0].1,
        ReconcileOutcome::Released(net("10.244.1.0/24"))
    );
    assert_eq!(agent.ctx.ipam.available(), 3);
    assert!(!agent.cluster.labels().contains_key("jovik31.dev.tenantcni.red"));
}

#[tokio::test]
async fn allocations_survive_an_agent_restart() {
    let dir = TempDir::new().unwrap();

    let mut agent = Agent::start(&dir);
    agent.observe(Event::Apply(tenant("blue", "1", &[NODE])));
    agent.observe(Event::Apply(tenant("red", "2", &[NODE])));
    agent.drain().await;
    let before = agent.ctx.ipam.snapshot();
    drop(agent);

    // A restarted agent relists red first; it must keep its old subnet
    let mut agent = Agent::start(&dir);
    agent.observe(Event::Init);
    agent.observe(Event::InitApply(tenant("red", "2", &[NODE])));
    agent.observe(Event::InitApply(tenant("blue", "1", &[NODE])));
    agent.observe(Event::InitDone);
    agent.drain().await;

    assert_eq!(agent.ctx.ipam.snapshot(), before);
}

#[tokio::test]
async fn exhausted_pool_fails_only_the_tenant_that_does_not_fit() {
    let dir = TempDir::new().unwrap();
    let mut agent = Agent::start(&dir);

    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        agent.observe(Event::Apply(tenant(name, &i.to_string(), &[NODE])));
    }
    agent.drain().await;

    let key = TenantKey::new("default", "e");
    agent.observe(Event::Apply(tenant("e", "9", &[NODE])));
    let item = agent.queue.get().await.unwrap();
    let err = reconcile(item.key(), &agent.ctx).await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert!(!err.is_retryable());
    item.finish();

    // Freeing a subnet lets the next pass for e succeed
    agent.observe(Event::Delete(tenant("a", "10", &[NODE])));
    agent.queue.add(key);
    let outcomes: BTreeMap<_, _> = agent
        .drain()
        .await
        .into_iter()
        .map(|(k, o)| (k.name().to_string(), o))
        .collect();
    assert_eq!(outcomes["a"], ReconcileOutcome::Released(net("10.244.0.0/24")));
    assert_eq!(outcomes["e"], ReconcileOutcome::Allocated(net("10.244.0.0/24")));
}

#[tokio::test]
async fn same_name_in_another_namespace_cannot_take_or_free_the_subnet() {
    let dir = TempDir::new().unwrap();
    let mut agent = Agent::start(&dir);

    agent.observe(Event::Apply(tenant_in("team-a", "blue", "1", &[NODE])));
    agent.drain().await;

    let team_b = TenantKey::new("team-b", "blue");
    agent.observe(Event::Apply(tenant_in("team-b", "blue", "2", &[NODE])));
    let item = agent.queue.get().await.unwrap();
    let err = reconcile(item.key(), &agent.ctx).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    item.finish();

    // Deleting team-b must leave team-a's subnet and label in place
    agent.observe(Event::Delete(tenant_in("team-b", "blue", "3", &[NODE])));
    let outcomes = agent.drain().await;
    assert_eq!(outcomes, vec![(team_b, ReconcileOutcome::Skipped)]);

    let record = agent.ctx.ipam.snapshot();
    assert_eq!(record.allocations.len(), 1);
    assert_eq!(record.allocations["team-a/blue"], net("10.244.0.0/24"));
    assert_eq!(agent.cluster.labels()["jovik31.dev.tenantcni.blue"], "Enabled");
    assert!(agent.cluster.status_of("team-b/blue").is_empty());
}

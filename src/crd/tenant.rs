//! Tenant Custom Resource Definition
//!
//! A Tenant names the nodes its network spans. Each node agent allocates a
//! subnet for the tenant out of its own pod CIDR and reports it back in
//! `status.allocations`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Tenant
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "jovik31.dev",
    version = "v1alpha1",
    kind = "Tenant",
    plural = "tenants",
    singular = "tenant",
    shortname = "tn",
    status = "TenantStatus",
    namespaced,
    printcolumn = r#"{"name":"Nodes","type":"string","jsonPath":".spec.nodes[*].name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Nodes the tenant network should be present on
    #[serde(default)]
    pub nodes: Vec<TenantNode>,
}

/// One member node of a tenant
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantNode {
    /// Kubernetes node name
    pub name: String,
}

impl TenantNode {
    /// Member entry for the named node
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TenantSpec {
    /// Spec spanning the given nodes
    pub fn with_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(TenantNode::new).collect(),
        }
    }

    /// Whether `node` is a member of this tenant
    pub fn includes_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n.name == node)
    }
}

/// Status for a Tenant
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Node name → subnet allocated to this tenant on that node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocations: BTreeMap<String, String>,
}

impl Tenant {
    /// Subnet recorded in status for `node`
    pub fn allocation_for(&self, node: &str) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.allocations.get(node))
            .map(String::as_str)
    }
}

/// Stable identity of a tenant: `namespace/name`, or `name` when cluster-scoped.
///
/// The `Display` form is the allocation key in the node store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey {
    namespace: Option<String>,
    name: String,
}

impl TenantKey {
    /// Key for a namespaced tenant
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an object
    pub fn of(tenant: &Tenant) -> Self {
        Self {
            namespace: tenant.namespace(),
            name: tenant.name_any(),
        }
    }

    /// Namespace, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Tenant name, the part used in the node label key
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for TenantKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::config(format!("invalid tenant key '{s}'"));
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            Some(_) => Err(invalid()),
            None if !s.is_empty() => Ok(Self {
                namespace: None,
                name: s.to_string(),
            }),
            None => Err(invalid()),
        }
    }
}

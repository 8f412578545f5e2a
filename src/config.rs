//! Configuration values passed into the store and the controller
//!
//! Nothing in the library reads process-wide state; the binary resolves
//! flags and environment into these structs and hands them down.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::BackoffConfig;
use crate::{Error, Result};

/// Longest label name Kubernetes accepts
const MAX_LABEL_NAME_LEN: usize = 63;

/// Longest label prefix (a DNS subdomain) Kubernetes accepts
const MAX_LABEL_PREFIX_LEN: usize = 253;

/// Default root directory for per-node state files
pub const DEFAULT_STATE_DIR: &str = "/var/lib/cni/tenantcni";

/// Default prefix length of the subnet handed to each tenant
pub const DEFAULT_SUBNET_PREFIX: u8 = 24;

/// Default reverse-domain prefix of the per-tenant node label
pub const DEFAULT_LABEL_DOMAIN: &str = "jovik31.dev";

/// Default plugin segment of the per-tenant node label
pub const DEFAULT_PLUGIN_NAME: &str = "tenantcni";

/// Value written to the per-tenant node label
pub const TENANT_ENABLED: &str = "Enabled";

/// Where a [`NodeStore`](crate::ipam::NodeStore) keeps its record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStoreConfig {
    /// Directory holding one `<node>.json` file per node
    pub root_dir: PathBuf,
}

impl Default for NodeStoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl NodeStoreConfig {
    /// Store rooted at the given directory
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }
}

/// Builds the node label that marks a tenant network as active on a node.
///
/// Key pattern: `<domain>.<plugin>.<tenant>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelConfig {
    /// Reverse-domain segment
    pub domain: String,
    /// Plugin segment
    pub plugin: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_LABEL_DOMAIN.to_string(),
            plugin: DEFAULT_PLUGIN_NAME.to_string(),
        }
    }
}

impl LabelConfig {
    /// Label key for the given tenant
    pub fn key_for(&self, tenant: &str) -> String {
        format!("{}.{}.{}", self.domain, self.plugin, tenant)
    }

    /// Label key for the given tenant, checked against the Kubernetes label
    /// key syntax so a node write can never be rejected for it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidLabel`] naming the rule the key breaks.
    pub fn checked_key_for(&self, tenant: &str) -> Result<String> {
        let key = self.key_for(tenant);
        validate_label_key(&key).map_err(|message| Error::InvalidLabel {
            tenant: tenant.to_string(),
            key: key.clone(),
            message,
        })?;
        Ok(key)
    }
}

/// `[prefix/]name`, where name is at most 63 characters of `[A-Za-z0-9._-]`
/// starting and ending alphanumeric, and prefix is a DNS subdomain.
fn validate_label_key(key: &str) -> std::result::Result<(), String> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if name.is_empty() || name.len() > MAX_LABEL_NAME_LEN {
        return Err(format!(
            "name part is {} characters, must be 1-{MAX_LABEL_NAME_LEN}",
            name.len()
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("name part may only contain [A-Za-z0-9._-]".to_string());
    }
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err("name part must start and end with an alphanumeric character".to_string());
    }

    if let Some(prefix) = prefix {
        let valid = !prefix.is_empty()
            && prefix.len() <= MAX_LABEL_PREFIX_LEN
            && prefix.split('.').all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                    && !part.starts_with('-')
                    && !part.ends_with('-')
            });
        if !valid {
            return Err(format!("prefix '{prefix}' is not a DNS subdomain"));
        }
    }
    Ok(())
}

/// Tunables for the tenant controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Name of the node this agent manages
    pub node_name: String,
    /// Node label naming
    pub labels: LabelConfig,
    /// Number of workers draining the queue
    pub workers: usize,
    /// Deadline for each Kubernetes API call made during reconcile
    pub api_timeout: Duration,
    /// Interval between full resyncs of every cached tenant
    pub resync_interval: Duration,
    /// Requeue schedule for keys whose reconcile failed transiently
    pub backoff: BackoffConfig,
}

impl ControllerConfig {
    /// Defaults for the given node
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            labels: LabelConfig::default(),
            workers: 2,
            api_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(600),
            backoff: BackoffConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_secs(300),
                multiplier: 2.0,
            },
        }
    }
}

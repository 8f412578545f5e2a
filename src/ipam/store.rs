//! Durable per-node allocation record
//!
//! A [`NodeStore`] owns one node's [`NodeRecord`]: its identity, the pool of
//! tenant subnets not yet handed out, and the tenant → subnet map. Every
//! mutation runs under an exclusive lock, is applied to a copy, written to
//! `<node>.json.tmp`, fsynced and renamed over `<node>.json`, and only then
//! becomes visible in memory. A crash at any point leaves either the old or
//! the new record on disk, never a torn one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NodeStoreConfig;
use crate::{Error, Result};

/// Everything this agent knows about its node's address space.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Node this record belongs to; never changes
    pub node_name: String,

    /// Node IP, set once at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<IpAddr>,

    /// Full pod CIDR of the node, set once at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_cidr: Option<Ipv4Net>,

    /// Prefix length the pool was partitioned at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_prefix: Option<u8>,

    /// Subnets not claimed by any tenant, lowest address first
    #[serde(default)]
    pub available_subnets: BTreeSet<Ipv4Net>,

    /// Tenant key (`namespace/name`) → claimed subnet
    #[serde(default)]
    pub allocations: BTreeMap<String, Ipv4Net>,
}

impl NodeRecord {
    /// Empty record for a node
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    /// True when no subnet is either available or allocated
    pub fn is_empty(&self) -> bool {
        self.available_subnets.is_empty() && self.allocations.is_empty()
    }

    /// Move `subnet` from the pool to `tenant`
    pub(crate) fn reserve(&mut self, tenant: &str, subnet: Ipv4Net) -> Result<()> {
        if tenant.is_empty() {
            return Err(Error::conflict(tenant, "tenant name is empty"));
        }
        if let Some(held) = self.allocations.get(tenant) {
            return Err(Error::conflict(
                tenant,
                format!("tenant already holds {held}"),
            ));
        }
        if !self.available_subnets.remove(&subnet) {
            return Err(Error::conflict(
                tenant,
                format!("subnet {subnet} is not available"),
            ));
        }
        self.allocations.insert(tenant.to_string(), subnet);
        Ok(())
    }

    /// Return `tenant`'s subnet to the pool
    pub(crate) fn release(&mut self, tenant: &str) -> Result<Ipv4Net> {
        let subnet = self
            .allocations
            .remove(tenant)
            .ok_or_else(|| Error::not_found(tenant))?;
        self.available_subnets.insert(subnet);
        Ok(subnet)
    }

    /// Check the invariants of a record read from disk: disjoint, inside the
    /// node CIDR, one prefix length throughout
    fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut seen = BTreeSet::new();
        for (tenant, subnet) in &self.allocations {
            if self.available_subnets.contains(subnet) {
                return Err(format!(
                    "subnet {subnet} is both available and allocated to {tenant}"
                ));
            }
            if !seen.insert(*subnet) {
                return Err(format!("subnet {subnet} is allocated twice"));
            }
        }
        if let Some(cidr) = self.node_cidr {
            let outside = self
                .available_subnets
                .iter()
                .chain(self.allocations.values())
                .find(|s| !cidr.contains(*s));
            if let Some(subnet) = outside {
                return Err(format!("subnet {subnet} lies outside node CIDR {cidr}"));
            }
        }

        let mut prefixes = self
            .available_subnets
            .iter()
            .chain(self.allocations.values())
            .map(|s| s.prefix_len());
        if let Some(first) = prefixes.next() {
            if let Some(odd) = prefixes.find(|p| *p != first) {
                return Err(format!("pool mixes /{first} and /{odd} subnets"));
            }
            if let Some(recorded) = self.subnet_prefix.filter(|p| *p != first) {
                return Err(format!(
                    "subnetPrefix /{recorded} does not match the /{first} subnets it holds"
                ));
            }
        }
        Ok(())
    }
}

/// Crash-safe, lock-guarded owner of one node's [`NodeRecord`].
#[derive(Debug)]
pub struct NodeStore {
    node_name: String,
    dir: PathBuf,
    path: PathBuf,
    record: Mutex<NodeRecord>,
}

impl NodeStore {
    /// Open the store for `node_name` under `config.root_dir`.
    ///
    /// An existing `<node>.json` is loaded as-is and overrides anything the
    /// caller would derive; otherwise an empty record is created and written
    /// so an unwritable directory fails here rather than on first allocation.
    pub fn open(config: &NodeStoreConfig, node_name: &str) -> Result<Self> {
        validate_node_name(node_name)?;

        let dir = config.root_dir.clone();
        fs::create_dir_all(&dir).map_err(|source| Error::Directory {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!("{node_name}.json"));
        let tmp = temp_path(&dir, node_name);
        match fs::remove_file(&tmp) {
            Ok(()) => warn!(path = ?tmp, "removed leftover temporary state file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?tmp, error = %e, "could not remove temporary state file"),
        }

        let store = match fs::read(&path) {
            Ok(bytes) => {
                let record = load_record(&path, &bytes, node_name)?;
                info!(
                    node = %node_name,
                    path = ?path,
                    allocations = record.allocations.len(),
                    available = record.available_subnets.len(),
                    "restored node state from disk"
                );
                Self {
                    node_name: node_name.to_string(),
                    dir,
                    path,
                    record: Mutex::new(record),
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let record = NodeRecord::new(node_name);
                let store = Self {
                    node_name: node_name.to_string(),
                    dir,
                    path,
                    record: Mutex::new(record.clone()),
                };
                store.persist(&record)?;
                info!(node = %node_name, path = ?store.path, "created empty node state");
                store
            }
            Err(source) => {
                return Err(Error::Directory {
                    path: path.clone(),
                    source,
                })
            }
        };

        Ok(store)
    }

    /// Node this store belongs to
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Canonical state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the node IP. Setting the same value again is a no-op.
    pub fn set_node_ip(&self, ip: IpAddr) -> Result<()> {
        self.update(|record| match record.node_ip {
            Some(current) if current != ip => Err(Error::AlreadySet {
                field: "nodeIP",
                current: current.to_string(),
                requested: ip.to_string(),
            }),
            _ => {
                record.node_ip = Some(ip);
                Ok(())
            }
        })
    }

    /// Record the node pod CIDR. Setting the same value again is a no-op.
    pub fn set_node_cidr(&self, cidr: Ipv4Net) -> Result<()> {
        let cidr = cidr.trunc();
        self.update(|record| match record.node_cidr {
            Some(current) if current != cidr => Err(Error::AlreadySet {
                field: "nodeCIDR",
                current: current.to_string(),
                requested: cidr.to_string(),
            }),
            _ => {
                record.node_cidr = Some(cidr);
                Ok(())
            }
        })
    }

    /// Seed the pool of tenant subnets.
    ///
    /// Only allowed while the store holds no subnets at all; after a restart
    /// the persisted pool and allocations win. Every subnet must share one
    /// prefix length and lie inside the node CIDR when it is known.
    pub fn set_available_pool(&self, subnets: impl IntoIterator<Item = Ipv4Net>) -> Result<()> {
        let pool: BTreeSet<Ipv4Net> = subnets.into_iter().map(|s| s.trunc()).collect();
        let Some(first) = pool.first() else {
            return Err(Error::config("refusing to seed an empty subnet pool"));
        };
        let prefix = first.prefix_len();
        if let Some(odd) = pool.iter().find(|s| s.prefix_len() != prefix) {
            return Err(Error::config(format!(
                "subnet {odd} does not match pool prefix /{prefix}"
            )));
        }

        self.update(|record| {
            if !record.is_empty() {
                return Err(Error::PoolAlreadySeeded {
                    node: record.node_name.clone(),
                });
            }
            if let Some(cidr) = record.node_cidr {
                if let Some(outside) = pool.iter().find(|s| !cidr.contains(*s)) {
                    return Err(Error::config(format!(
                        "subnet {outside} lies outside node CIDR {cidr}"
                    )));
                }
            }
            record.subnet_prefix = Some(prefix);
            record.available_subnets = pool;
            Ok(())
        })?;

        info!(node = %self.node_name, prefix, "seeded tenant subnet pool");
        Ok(())
    }

    /// Atomically move `subnet` from the pool to `tenant`.
    ///
    /// Fails with [`Error::Conflict`] if the subnet is not available or the
    /// tenant already holds one.
    pub fn reserve(&self, tenant: &str, subnet: Ipv4Net) -> Result<()> {
        self.update(|record| record.reserve(tenant, subnet))
    }

    /// Atomically return `tenant`'s subnet to the pool and hand it back.
    ///
    /// Fails with [`Error::NotFound`], leaving state untouched, when the
    /// tenant holds nothing.
    pub fn release(&self, tenant: &str) -> Result<Ipv4Net> {
        self.update(|record| record.release(tenant))
    }

    /// Subnet currently held by `tenant`
    pub fn lookup(&self, tenant: &str) -> Option<Ipv4Net> {
        self.record.lock().allocations.get(tenant).copied()
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> NodeRecord {
        self.record.lock().clone()
    }

    /// Run `op` on a copy of the record under the store lock and commit it.
    ///
    /// The copy is persisted before it replaces the in-memory record, so a
    /// failed write leaves the store exactly as it was. Unchanged records are
    /// not rewritten.
    pub(crate) fn update<T>(&self, op: impl FnOnce(&mut NodeRecord) -> Result<T>) -> Result<T> {
        let mut current = self.record.lock();
        let mut next = current.clone();
        let out = op(&mut next)?;
        if next != *current {
            self.persist(&next)?;
            *current = next;
        } else {
            debug!(node = %self.node_name, "node state unchanged, skipping write");
        }
        Ok(out)
    }

    fn persist(&self, record: &NodeRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::serialization(format!("node record: {e}")))?;
        let tmp = temp_path(&self.dir, &self.node_name);
        let persistence = |source| Error::Persistence {
            path: self.path.clone(),
            source,
        };

        let mut file = File::create(&tmp).map_err(persistence)?;
        file.write_all(&bytes).map_err(persistence)?;
        file.sync_all().map_err(persistence)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(persistence)?;
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(persistence)?;
        Ok(())
    }
}

fn temp_path(dir: &Path, node_name: &str) -> PathBuf {
    dir.join(format!("{node_name}.json.tmp"))
}

fn load_record(path: &Path, bytes: &[u8], node_name: &str) -> Result<NodeRecord> {
    let corrupt = |message: String| Error::CorruptState {
        path: path.to_path_buf(),
        message,
    };
    let record: NodeRecord =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("unreadable record: {e}")))?;
    if record.node_name != node_name {
        return Err(corrupt(format!(
            "record belongs to node {} not {node_name}",
            record.node_name
        )));
    }
    record.check_invariants().map_err(corrupt)?;
    Ok(record)
}

fn validate_node_name(node_name: &str) -> Result<()> {
    if node_name.is_empty()
        || node_name == "."
        || node_name == ".."
        || node_name.contains(['/', '\\', '\0'])
    {
        return Err(Error::config(format!(
            "node name '{node_name}' cannot be used as a state file name"
        )));
    }
    Ok(())
}

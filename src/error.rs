//! Error types for the tenant CNI node agent
//!
//! Errors carry the context needed to decide what the reconcile loop does
//! next: retry with backoff, give up on the key until it changes, or abort
//! startup. See [`Error::is_retryable`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for tenant CNI operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A CIDR string could not be parsed or is not an IPv4 block
    #[error("invalid CIDR '{value}': {message}")]
    InvalidCidr {
        /// The offending input
        value: String,
        /// Why it was rejected
        message: String,
    },

    /// Requested subnet prefix cannot be carved out of the block
    #[error("invalid prefix length /{prefix_len} for block {block}")]
    InvalidPrefix {
        /// The block being partitioned
        block: String,
        /// The requested subnet prefix length
        prefix_len: u8,
    },

    /// Missing or inconsistent startup configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is missing or wrong
        message: String,
    },

    /// The node store directory could not be created or opened
    #[error("state directory {path:?} unavailable: {source}")]
    Directory {
        /// Directory that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The node record could not be written to disk
    #[error("failed to persist node state to {path:?}: {source}")]
    Persistence {
        /// Canonical state file path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The persisted node record exists but cannot be used
    #[error("corrupt node state in {path:?}: {message}")]
    CorruptState {
        /// Canonical state file path
        path: PathBuf,
        /// What is wrong with it
        message: String,
    },

    /// A one-time node identity field was set twice with different values
    #[error("{field} already set to {current}, refusing to change it to {requested}")]
    AlreadySet {
        /// Field name (nodeIP, nodeCIDR)
        field: &'static str,
        /// Value already recorded
        current: String,
        /// Value that was offered
        requested: String,
    },

    /// The subnet pool was already seeded for this node
    #[error("subnet pool for node {node} is already seeded")]
    PoolAlreadySeeded {
        /// Node owning the store
        node: String,
    },

    /// Reservation would violate the allocation invariants
    #[error("allocation conflict for tenant {tenant}: {message}")]
    Conflict {
        /// Tenant being reserved
        tenant: String,
        /// Description of the conflict
        message: String,
    },

    /// A tenant's node label key is not a valid Kubernetes label name
    #[error("label key '{key}' for tenant {tenant} is invalid: {message}")]
    InvalidLabel {
        /// Tenant the label belongs to
        tenant: String,
        /// The generated key
        key: String,
        /// Why Kubernetes would reject it
        message: String,
    },

    /// The tenant holds no allocation on this node
    #[error("tenant {tenant} has no allocation on this node")]
    NotFound {
        /// Tenant that was looked up
        tenant: String,
    },

    /// No subnets left in the node pool
    #[error("subnet pool exhausted on node {node}, cannot allocate for tenant {tenant}")]
    PoolExhausted {
        /// Node owning the pool
        node: String,
        /// Tenant that asked
        tenant: String,
    },

    /// Optimistic concurrency check failed on a write
    #[error("{kind} {name} was modified concurrently")]
    VersionConflict {
        /// Kubernetes kind (Node, Tenant)
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// An external call did not complete in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Name of the operation
        operation: String,
        /// Configured deadline
        after: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an invalid CIDR error
    pub fn invalid_cidr(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidCidr {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create an allocation conflict error for a tenant
    pub fn conflict(tenant: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            tenant: tenant.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a tenant
    pub fn not_found(tenant: impl Into<String>) -> Self {
        Self::NotFound {
            tenant: tenant.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether the reconcile loop should requeue the key with backoff.
    ///
    /// Transient external failures and failed state writes are retried.
    /// Configuration problems, invariant violations, pool exhaustion and
    /// requests the API server rejected outright (4xx other than 409 and
    /// 429) are not: they need a resource or operator change first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(response) => {
                    !(400..500).contains(&response.code)
                        || response.code == 409
                        || response.code == 429
                }
                _ => true,
            },
            Error::VersionConflict { .. }
            | Error::Timeout { .. }
            | Error::Persistence { .. } => true,
            Error::InvalidCidr { .. }
            | Error::InvalidPrefix { .. }
            | Error::Config { .. }
            | Error::Directory { .. }
            | Error::CorruptState { .. }
            | Error::AlreadySet { .. }
            | Error::PoolAlreadySeeded { .. }
            | Error::Conflict { .. }
            | Error::InvalidLabel { .. }
            | Error::NotFound { .. }
            | Error::PoolExhausted { .. }
            | Error::Serialization { .. } => false,
        }
    }
}

/// Map a kube API error, turning HTTP 409 into [`Error::VersionConflict`]
pub(crate) fn from_kube_write(kind: &'static str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 409 => Error::VersionConflict {
            kind,
            name: name.to_string(),
        },
        other => Error::Kube { source: other },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    /// Story: transient API failures never crash the controller
    ///
    /// Version conflicts and API outages go back on the queue with backoff.
    #[test]
    fn story_transient_errors_are_retried() {
        assert!(Error::VersionConflict {
            kind: "Node",
            name: "worker-1".to_string(),
        }
        .is_retryable());
        assert!(Error::Timeout {
            operation: "get node".to_string(),
            after: Duration::from_secs(10),
        }
        .is_retryable());
        assert!(Error::from(api_error(503, "ServiceUnavailable")).is_retryable());
    }

    /// Story: a full pool is reported, not retried in a hot loop
    #[test]
    fn story_exhaustion_is_permanent_for_now() {
        let err = Error::PoolExhausted {
            node: "worker-1".to_string(),
            tenant: "blue".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("exhausted"));
        assert!(err.to_string().contains("blue"));
    }

    /// Story: losing the disk write is surfaced and retried, never swallowed
    #[test]
    fn story_persistence_failures_are_retried() {
        let err = Error::Persistence {
            path: PathBuf::from("/var/lib/cni/tenantcni/worker-1.json"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("disk full"));
    }

    /// Story: invariant violations surface to the caller
    #[test]
    fn story_conflicts_are_not_retried() {
        assert!(!Error::conflict("blue", "already holds 10.244.0.0/24").is_retryable());
        assert!(!Error::not_found("blue").is_retryable());
        assert!(!Error::config("node CIDR missing").is_retryable());
    }

    /// Story: a request the API server rejects is not retried forever
    ///
    /// Invalid, forbidden and malformed writes fail the same way on every
    /// attempt; throttling and outages do not.
    #[test]
    fn story_rejected_requests_are_permanent() {
        for (code, reason) in [
            (400, "BadRequest"),
            (403, "Forbidden"),
            (404, "NotFound"),
            (422, "Invalid"),
        ] {
            let err = from_kube_write("Node", "worker-1", api_error(code, reason));
            assert!(!err.is_retryable(), "{code} should be permanent");
        }
        for (code, reason) in [
            (409, "Conflict"),
            (429, "TooManyRequests"),
            (500, "InternalError"),
            (503, "ServiceUnavailable"),
        ] {
            let err = from_kube_write("Node", "worker-1", api_error(code, reason));
            assert!(err.is_retryable(), "{code} should be retried");
        }
        assert!(Error::from(api_error(429, "TooManyRequests")).is_retryable());
    }

    #[test]
    fn http_conflict_maps_to_version_conflict() {
        match from_kube_write("Node", "worker-1", api_error(409, "Conflict")) {
            Error::VersionConflict { kind, name } => {
                assert_eq!(kind, "Node");
                assert_eq!(name, "worker-1");
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
        assert!(matches!(
            from_kube_write("Node", "worker-1", api_error(500, "InternalError")),
            Error::Kube { .. }
        ));
    }
}

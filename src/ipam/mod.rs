//! Node IP address management
//!
//! The node's pod CIDR is partitioned into equally sized tenant subnets
//! ([`partition`]), tracked durably per node ([`NodeStore`]) and handed out
//! one per tenant ([`NodeIpam`]).

mod node_ipam;
mod partition;
mod store;

pub use node_ipam::NodeIpam;
pub use partition::{parse_cidr, partition, subnet_count};
pub use store::{NodeRecord, NodeStore};

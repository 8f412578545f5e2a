//! Subnet partitioning
//!
//! Pure functions: the same block and prefix always produce the same ordered
//! list, so a restarted agent agrees with the pool it persisted earlier.

use ipnet::{IpNet, Ipv4Net};

use crate::{Error, Result};

/// Parse an IPv4 CIDR block, normalising away host bits.
///
/// `10.244.1.7/16` becomes `10.244.0.0/16`. IPv6 blocks are rejected.
pub fn parse_cidr(value: &str) -> Result<Ipv4Net> {
    let net: IpNet = value
        .trim()
        .parse()
        .map_err(|e| Error::invalid_cidr(value, format!("{e}")))?;
    match net {
        IpNet::V4(v4) => Ok(v4.trunc()),
        IpNet::V6(_) => Err(Error::invalid_cidr(value, "only IPv4 blocks are supported")),
    }
}

/// Split `block` into every `/prefix_len` subnet it contains, lowest base
/// address first.
///
/// When `prefix_len` equals the block's own prefix the block itself is the
/// only element.
///
/// # Errors
///
/// [`Error::InvalidPrefix`] if `prefix_len` is shorter than the block's
/// prefix or longer than 32.
pub fn partition(block: Ipv4Net, prefix_len: u8) -> Result<Vec<Ipv4Net>> {
    let block = block.trunc();
    block
        .subnets(prefix_len)
        .map(|subnets| subnets.collect())
        .map_err(|_| Error::InvalidPrefix {
            block: block.to_string(),
            prefix_len,
        })
}

/// Number of `/prefix_len` subnets in `block`, without materialising them.
pub fn subnet_count(block: Ipv4Net, prefix_len: u8) -> Result<u64> {
    if prefix_len < block.prefix_len() || prefix_len > block.max_prefix_len() {
        return Err(Error::InvalidPrefix {
            block: block.trunc().to_string(),
            prefix_len,
        });
    }
    Ok(1u64 << (prefix_len - block.prefix_len()))
}

//! Shared types for the chordal ring: the 160-bit identifier space, the wire
//! messages exchanged between peers, and the error taxonomy.

pub mod dht_messages;
pub mod error;

use sha1::{Digest, Sha1};
use std::net::SocketAddr;

pub use dht_messages::{DhtMessage, Entry, NodeId};
pub use error::{ChordError, Result};

/// Number of bits in the identifier space (SHA-1 digest width).
pub const ID_BITS: usize = 160;
const ID_BYTES: usize = ID_BITS / 8;

/// Hashes arbitrary bytes onto the ring.
pub fn hash(bytes: &[u8]) -> NodeId {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Returns `(id + 2^exponent) mod 2^160`.
pub fn add_power_of_two(id: &NodeId, exponent: usize) -> NodeId {
    let mut result = *id;
    if exponent >= ID_BITS {
        // 2^160 is congruent to zero
        return result;
    }

    let mut index = ID_BYTES - 1 - exponent / 8;
    let mut carry = 1u16 << (exponent % 8);
    while carry > 0 {
        let Some(byte) = result.get_mut(index) else {
            break;
        };
        let sum = u16::from(*byte) + carry;
        *byte = (sum & 0xff) as u8;
        carry = sum >> 8;
        if index == 0 {
            // overflow past the top byte wraps around the ring
            break;
        }
        index -= 1;
    }
    result
}

// Checks if an ID lies strictly inside the clockwise arc from `lower` to `upper`.
// When `lower == upper` the arc covers the whole ring except `lower` itself.
pub fn is_between(id: &NodeId, lower: &NodeId, upper: &NodeId) -> bool {
    is_between_with(id, lower, upper, false, false)
}

// The ownership arc `(lower, upper]`.
pub fn is_between_right_inclusive(id: &NodeId, lower: &NodeId, upper: &NodeId) -> bool {
    is_between_with(id, lower, upper, false, true)
}

pub fn is_between_with(
    id: &NodeId,
    lower: &NodeId,
    upper: &NodeId,
    lower_inclusive: bool,
    upper_inclusive: bool,
) -> bool {
    if (lower_inclusive && id == lower) || (upper_inclusive && id == upper) {
        return true;
    }
    if lower < upper {
        lower < id && id < upper
    } else {
        // Wraps around zero (or lower == upper)
        lower < id || id < upper
    }
}

/// Validates a `host:port` peer address. The returned string is the exact
/// preimage used for the node id, so callers must keep it verbatim.
pub fn parse_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    match trimmed.parse::<SocketAddr>() {
        Ok(socket) if socket.port() != 0 => Ok(trimmed.to_string()),
        Ok(_) => Err(ChordError::InvalidArgument(format!(
            "port of '{}' must be between 1 and 65535",
            address
        ))),
        Err(_) => Err(ChordError::InvalidArgument(format!(
            "'{}' is not a host:port address",
            address
        ))),
    }
}

/// First four bytes of an id in hex, for log lines.
pub fn short_id(id: &NodeId) -> String {
    hex::encode(id.get(..4).unwrap_or_default())
}

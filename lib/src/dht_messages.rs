use serde::{Deserialize, Serialize};

use crate::error::ChordError;

// 160-bit ID for Chord, big-endian
pub type NodeId = [u8; 20];

/// A stored key/value pair addressed by its hashed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: NodeId,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DhtMessage {
    // Liveness probe, echoed back as Pong
    Ping {
        sender: String,
    },
    Pong {
        sender: String,
    },
    // Selective snapshot of a peer's routing state
    GetState {
        predecessor: bool,
        successor: bool,
        finger: bool,
    },
    State {
        predecessor: Option<String>,
        successor: Option<Vec<String>>,
        finger: Option<Vec<String>>,
    },
    // Resolve the node owning `id`; may recurse on the receiving side
    Lookup {
        id: NodeId,
    },
    FoundSuccessor {
        successor: String,
    },
    // The sender believes it is our predecessor
    Notify {
        sender: String,
    },
    // Ownership-validated key/value access
    Get {
        id: NodeId,
    },
    Set {
        id: NodeId,
        value: Vec<u8>,
    },
    Delete {
        id: NodeId,
    },
    Value {
        value: Option<Vec<u8>>,
    },
    Ack,
    // Export entries in (receiver, bound], optionally removing them
    Partition {
        bound: NodeId,
        delete: bool,
    },
    Entries {
        entries: Vec<Entry>,
    },
    // Dump of the receiver's local entries, for debugging
    All {
        sender: String,
    },
    // Hand-off from a departing predecessor
    Merge {
        sender: String,
        predecessor: Option<String>,
        entries: Vec<Entry>,
    },
    Merged {
        absorbed: u64,
    },
    Error(ChordError),
}

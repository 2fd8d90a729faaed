use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Membership changes observed by a node, published for the storage and
/// replication layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEvent {
    /// Addresses newly adopted into the successor list.
    SuccessorUp(Vec<String>),
    /// Addresses dropped from the successor list.
    SuccessorDown(Vec<String>),
    /// An inbound notify was handled.
    Notified { sender: String },
    /// First inbound notify after a join: the predecessor has linked this
    /// node into the ring, so range-dependent work (partition) may start.
    Joined { successor: String },
}

pub(crate) fn channel() -> broadcast::Sender<RingEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Symmetric difference between two successor lists, excluding `own_address`.
/// Returns `(up, down)` with duplicates removed, in list order.
pub(crate) fn successor_changes(
    old: &[String],
    new: &[String],
    own_address: &str,
) -> (Vec<String>, Vec<String>) {
    let difference = |from: &[String], against: &[String]| {
        let mut out: Vec<String> = Vec::new();
        for address in from {
            if address != own_address && !against.contains(address) && !out.contains(address) {
                out.push(address.clone());
            }
        }
        out
    };
    (difference(new, old), difference(old, new))
}

use chordal_lib::{
    hash, is_between_right_inclusive, short_id, ChordError, DhtMessage, Entry, NodeId, Result,
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::events::RingEvent;
use crate::network_client::NetworkClient;
use crate::node::{unexpected_reply, ChordNode, NodeInfo};

const CLIENT_ATTEMPTS: u32 = 3;
const CLIENT_RETRY_DELAY: Duration = Duration::from_millis(100);

impl<T: NetworkClient> ChordNode<T> {
    /// True when `id` falls in `(predecessor, self]`. Without a known
    /// predecessor nothing is owned.
    pub fn owns(&self, id: &NodeId) -> bool {
        self.check_ownership(id).is_ok()
    }

    fn check_ownership(&self, id: &NodeId) -> Result<()> {
        let Some(predecessor) = self.predecessor() else {
            return Err(ChordError::OwnershipViolation(
                "predecessor unknown, cannot claim any key".to_string(),
            ));
        };
        if is_between_right_inclusive(id, &predecessor.id, &self.info.id) {
            Ok(())
        } else {
            Err(ChordError::OwnershipViolation(format!(
                "{} is outside ({}, {}]",
                short_id(id),
                short_id(&predecessor.id),
                short_id(&self.info.id)
            )))
        }
    }

    pub fn get_local(&self, id: &NodeId) -> Result<Option<Vec<u8>>> {
        self.check_ownership(id)?;
        Ok(self.data.lock().get(id).cloned())
    }

    pub fn set_local(&self, id: NodeId, value: Vec<u8>) -> Result<()> {
        self.check_ownership(&id)?;
        self.data.lock().insert(id, value);
        log_debug!(self.info.address, "Stored key: {}", hex::encode(id));
        Ok(())
    }

    pub fn delete_local(&self, id: &NodeId) -> Result<Option<Vec<u8>>> {
        self.check_ownership(id)?;
        Ok(self.data.lock().remove(id))
    }

    /// Entries held locally whose id lies in `(lower, upper]`, removed when
    /// `delete` is set.
    pub fn partition(&self, lower: &NodeId, upper: &NodeId, delete: bool) -> Result<Vec<Entry>> {
        if lower == upper {
            return Err(ChordError::InvalidArgument(
                "partition bounds must differ".to_string(),
            ));
        }

        let mut data = self.data.lock();
        let ids: Vec<NodeId> = data
            .keys()
            .filter(|id| is_between_right_inclusive(id, lower, upper))
            .copied()
            .collect();

        let entries = ids
            .into_iter()
            .filter_map(|id| {
                let value = if delete {
                    data.remove(&id)
                } else {
                    data.get(&id).cloned()
                };
                value.map(|value| Entry { id, value })
            })
            .collect();
        Ok(entries)
    }

    // Server side of a partition request: everything from us up to `bound`.
    // Only our current predecessor may ask, for the range it took over.
    pub(crate) fn serve_partition(&self, bound: NodeId, delete: bool) -> Result<Vec<Entry>> {
        if bound == self.info.id {
            return Err(ChordError::InvalidArgument(
                "partition bound equals our own id".to_string(),
            ));
        }
        match self.predecessor() {
            None => {
                return Err(ChordError::OwnershipViolation(
                    "predecessor unknown, refusing to partition".to_string(),
                ))
            }
            Some(predecessor) if predecessor.id != bound => {
                return Err(ChordError::OwnershipViolation(format!(
                    "partition up to {} requested but predecessor is {}",
                    short_id(&bound),
                    short_id(&predecessor.id)
                )))
            }
            Some(_) => {}
        }
        let entries = self.partition(&self.info.id, &bound, delete)?;
        log_info!(
            self.info.address,
            "Partitioned {} entries up to {}",
            entries.len(),
            short_id(&bound)
        );
        Ok(entries)
    }

    /// Absorbs the entries that fall in our ownership interval and returns
    /// how many were taken.
    pub fn merge(&self, entries: Vec<Entry>) -> Result<usize> {
        if self.predecessor().is_none() {
            return Err(ChordError::OwnershipViolation(
                "predecessor unknown, refusing to merge".to_string(),
            ));
        }

        let total = entries.len();
        let owned: Vec<Entry> = entries
            .into_iter()
            .filter(|entry| self.owns(&entry.id))
            .collect();
        if owned.len() < total {
            log_warn!(
                self.info.address,
                "Dropped {} merged entries outside our range",
                total - owned.len()
            );
        }
        Ok(self.absorb(owned))
    }

    fn absorb(&self, entries: Vec<Entry>) -> usize {
        let mut data = self.data.lock();
        let count = entries.len();
        for entry in entries {
            data.insert(entry.id, entry.value);
        }
        count
    }

    // Keys written here since the join are newer than the pulled copies.
    fn absorb_missing(&self, entries: Vec<Entry>) -> usize {
        let mut data = self.data.lock();
        let mut taken = 0;
        for entry in entries {
            if let std::collections::hash_map::Entry::Vacant(slot) = data.entry(entry.id) {
                slot.insert(entry.value);
                taken += 1;
            }
        }
        taken
    }

    // Receiving side of a leave.
    pub(crate) fn accept_handoff(
        &self,
        sender: &str,
        predecessor: Option<&str>,
        entries: Vec<Entry>,
    ) -> Result<usize> {
        let sender = NodeInfo::new(sender)?;
        let replacement = predecessor.map(NodeInfo::new).transpose()?;

        let from_predecessor = {
            let mut current = self.predecessor.lock();
            let is_current = current
                .as_ref()
                .is_some_and(|p| p.address == sender.address);
            if is_current {
                *current = replacement.clone();
            }
            is_current
        };

        if from_predecessor {
            log_info!(
                self.info.address,
                "Predecessor {} left, predecessor is now {}",
                sender.address,
                replacement
                    .as_ref()
                    .map(|p| p.address.as_str())
                    .unwrap_or("unknown")
            );
            // Its range is now ours, so every entry belongs here
            Ok(self.absorb(entries))
        } else {
            self.merge(entries)
        }
    }

    /// Pulls the range `(successor, self]` from `successor` and stores it.
    pub async fn pull_partition(&self, successor: &NodeInfo) -> Result<usize> {
        if self.predecessor().is_none() {
            return Err(ChordError::OwnershipViolation(
                "predecessor unknown, cannot pull partition".to_string(),
            ));
        }
        if self.is_self(successor) {
            return Ok(0);
        }

        let reply = self
            .network_client
            .call_node(
                &successor.address,
                DhtMessage::Partition {
                    bound: self.info.id,
                    delete: true,
                },
            )
            .await?;
        match reply {
            DhtMessage::Entries { entries } => {
                // The successor already gave these up, so none may be dropped
                // for ownership reasons, only for being stale
                let total = entries.len();
                let merged = self.absorb_missing(entries);
                log_info!(
                    self.info.address,
                    "Took over {} entries from {} ({} superseded by local writes)",
                    merged,
                    successor.address,
                    total - merged
                );
                Ok(merged)
            }
            other => Err(unexpected_reply(&successor.address, other)),
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let id = hash(key);
        match self.call_owner_with_retry(id, DhtMessage::Get { id }).await? {
            DhtMessage::Value { value } => Ok(value),
            other => Err(unexpected_reply("owner", other)),
        }
    }

    pub async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let id = hash(key);
        match self
            .call_owner_with_retry(id, DhtMessage::Set { id, value })
            .await?
        {
            DhtMessage::Ack => Ok(()),
            other => Err(unexpected_reply("owner", other)),
        }
    }

    pub async fn delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let id = hash(key);
        match self.call_owner_with_retry(id, DhtMessage::Delete { id }).await? {
            DhtMessage::Value { value } => Ok(value),
            other => Err(unexpected_reply("owner", other)),
        }
    }

    /// True if some node holds a value for `key`.
    pub async fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Every entry stored on the node at `address`, regardless of ownership.
    /// Meant for debugging.
    pub async fn all(&self, address: &str) -> Result<Vec<Entry>> {
        let peer = NodeInfo::new(address)?;
        if self.is_self(&peer) {
            return Ok(self.local_entries());
        }
        let reply = self
            .network_client
            .call_node(
                &peer.address,
                DhtMessage::All {
                    sender: self.info.address.clone(),
                },
            )
            .await?;
        match reply {
            DhtMessage::Entries { entries } => Ok(entries),
            other => Err(unexpected_reply(&peer.address, other)),
        }
    }

    async fn call_owner_with_retry(&self, id: NodeId, message: DhtMessage) -> Result<DhtMessage> {
        let mut delay = CLIENT_RETRY_DELAY;
        let mut last_error = None;

        for attempt in 0..CLIENT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            match self.call_owner(id, message.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    log_debug!(
                        self.info.address,
                        "Request for {} failed (attempt {}/{}): {}",
                        short_id(&id),
                        attempt + 1,
                        CLIENT_ATTEMPTS,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ChordError::PeerUnreachable(format!("no attempt made for {}", short_id(&id)))
        }))
    }

    async fn call_owner(&self, id: NodeId, message: DhtMessage) -> Result<DhtMessage> {
        let owner = self.find_successor(id).await?;
        let reply = if self.is_self(&owner) {
            self.handle_message(message).await
        } else {
            self.network_client.call_node(&owner.address, message).await?
        };
        match reply {
            DhtMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// Moves keys to this node once it is fully joined: on `Joined`, the range
/// it now owns is pulled from its successor.
pub fn spawn_key_migration<T: NetworkClient>(node: ChordNode<T>) -> JoinHandle<()> {
    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RingEvent::Joined { successor }) => {
                    let result = match NodeInfo::from_peer(&successor) {
                        Ok(successor) => node.pull_partition(&successor).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        log_error!(
                            node.info.address,
                            "Key migration from {} failed: {}",
                            successor,
                            e
                        );
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    log_warn!(node.info.address, "Key migration missed {} events", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

use chordal_lib::{is_between, ChordError, DhtMessage, Result};
use std::sync::atomic::Ordering;

use crate::events::RingEvent;
use crate::network_client::NetworkClient;
use crate::node::{unexpected_reply, ChordNode, NodeInfo, M};

impl<T: NetworkClient> ChordNode<T> {
    /// Joins the ring known to `bootstrap_address`. Maintenance ticks are
    /// held off until the new successor list is in place.
    pub async fn join(&self, bootstrap_address: &str) -> Result<()> {
        let bootstrap = NodeInfo::new(bootstrap_address)?;
        if self.is_self(&bootstrap) {
            return Err(ChordError::InvalidArgument(
                "cannot bootstrap from our own address".to_string(),
            ));
        }
        if self.is_joined() {
            return Err(ChordError::InvalidState(format!(
                "already joined with successor {}",
                self.successor().address
            )));
        }

        log_info!(
            self.info.address,
            "Attempting to join network via bootstrap node: {}",
            bootstrap.address
        );
        // Released on every exit path
        let _paused = self.maintenance.gate.lock().await;

        let reply = self
            .network_client
            .call_node(&bootstrap.address, DhtMessage::Lookup { id: self.info.id })
            .await?;
        let successor = match reply {
            DhtMessage::FoundSuccessor { successor } => NodeInfo::from_peer(&successor)?,
            other => return Err(unexpected_reply(&bootstrap.address, other)),
        };
        if self.is_self(&successor) {
            return Err(ChordError::InvalidState(format!(
                "{} already routes our id to us",
                bootstrap.address
            )));
        }

        let (predecessor, successors) = self.fetch_state(&successor).await?;
        let list = self.build_successor_list(successor.clone(), successors);

        *self.predecessor.lock() = predecessor.filter(|p| !self.is_self(p));
        *self.successors.lock() = list.clone();
        self.awaiting_first_notify.store(true, Ordering::SeqCst);

        log_info!(
            self.info.address,
            "Joined network. Successor: {} at {}",
            hex::encode(successor.id),
            successor.address
        );
        self.emit(RingEvent::SuccessorUp(
            list.iter()
                .filter(|n| !self.is_self(n))
                .map(|n| n.address.clone())
                .collect(),
        ));
        Ok(())
    }

    /// Rectify: adopts `sender` as predecessor when it is closer than the
    /// current one or the current one is dead.
    pub async fn notify(&self, sender: NodeInfo) {
        let current = self.predecessor();

        let adopt = match &current {
            None => true,
            Some(predecessor) if predecessor.address == sender.address => false,
            Some(predecessor) if is_between(&sender.id, &predecessor.id, &self.info.id) => true,
            Some(predecessor) => self.ping(predecessor).await.is_err(),
        };

        if adopt {
            let adopted = {
                let mut predecessor = self.predecessor.lock();
                // Someone else may have updated it while we were pinging
                if *predecessor == current {
                    *predecessor = Some(sender.clone());
                    true
                } else {
                    false
                }
            };
            if adopted && !self.is_self(&sender) {
                log_info!(
                    self.info.address,
                    "Predecessor is now {} at {}",
                    hex::encode(sender.id),
                    sender.address
                );
            }
        }

        if self.is_self(&sender) {
            return;
        }
        self.emit(RingEvent::Notified {
            sender: sender.address.clone(),
        });
        if self.awaiting_first_notify.swap(false, Ordering::SeqCst) {
            let successor = self.successor();
            log_info!(
                self.info.address,
                "Fully joined after notify from {}",
                sender.address
            );
            self.emit(RingEvent::Joined {
                successor: successor.address,
            });
        }
    }

    /// Leaves the ring: stops maintenance, hands local entries to the
    /// first live successor and stops the RPC listener. The hand-off is
    /// best effort.
    pub async fn leave(&self) {
        self.stop_maintenance();
        let _gate = self.maintenance.gate.lock().await;

        // Entries stay local until a successor confirms the hand-off
        let entries = self.local_entries();
        let predecessor = self.predecessor();
        let successors = self.successor_list();

        let mut handed_off = false;
        let mut tried: Vec<&str> = Vec::new();
        for successor in successors.iter().filter(|s| !self.is_self(s)) {
            if tried.contains(&successor.address.as_str()) {
                continue;
            }
            tried.push(&successor.address);

            let message = DhtMessage::Merge {
                sender: self.info.address.clone(),
                predecessor: predecessor.as_ref().map(|p| p.address.clone()),
                entries: entries.clone(),
            };
            match self.network_client.call_node(&successor.address, message).await {
                Ok(DhtMessage::Merged { absorbed }) => {
                    log_info!(
                        self.info.address,
                        "Handed {} of {} entries to {}",
                        absorbed,
                        entries.len(),
                        successor.address
                    );
                    let mut data = self.data.lock();
                    for entry in &entries {
                        data.remove(&entry.id);
                    }
                    handed_off = true;
                    break;
                }
                Ok(other) => {
                    log_warn!(
                        self.info.address,
                        "Hand-off to {} rejected: {}",
                        successor.address,
                        unexpected_reply(&successor.address, other)
                    );
                }
                Err(e) => {
                    log_warn!(
                        self.info.address,
                        "Hand-off to {} failed: {}",
                        successor.address,
                        e
                    );
                }
            }
        }
        if !handed_off && !entries.is_empty() {
            log_warn!(
                self.info.address,
                "No successor took over {} entries, keeping them locally",
                entries.len()
            );
        }

        *self.predecessor.lock() = None;
        *self.successors.lock() = vec![self.info.clone(); self.successor_list_len];
        *self.finger_table.lock() = vec![self.info.clone(); M];
        self.awaiting_first_notify.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        log_info!(self.info.address, "Left the ring");
    }
}

use chordal_lib::{add_power_of_two, is_between};
use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::events::{self, RingEvent};
use crate::network_client::NetworkClient;
use crate::node::{ChordNode, NodeInfo, M};

/// Background upkeep owned by one node: the finger cursor, the gate that
/// serialises ticks with join and leave, and the periodic task.
#[derive(Default)]
pub struct Maintenance {
    finger_cursor: Mutex<usize>,
    pub(crate) gate: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: NetworkClient> ChordNode<T> {
    /// Spawns the periodic scheduler. Each tick runs on its own task; a
    /// tick that finds the gate taken is skipped.
    pub fn start_maintenance(&self, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let jitter = Duration::from_millis(
            rand::thread_rng().gen_range(0..=period.as_millis().min(u128::from(u64::MAX)) as u64),
        );
        let node = self.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + jitter, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let node = node.clone();
                tokio::spawn(async move {
                    node.try_maintenance_tick().await;
                });
            }
        });

        if let Some(previous) = self.maintenance.task.lock().replace(handle) {
            previous.abort();
        }
        log_info!(self.info.address, "Maintenance started every {:?}", period);
    }

    pub fn stop_maintenance(&self) {
        if let Some(handle) = self.maintenance.task.lock().take() {
            handle.abort();
            log_info!(self.info.address, "Maintenance stopped");
        }
    }

    /// Runs one full maintenance pass, waiting for the gate.
    pub async fn maintenance_tick(&self) {
        let _gate = self.maintenance.gate.lock().await;
        self.run_tick().await;
    }

    async fn try_maintenance_tick(&self) {
        let Ok(_gate) = self.maintenance.gate.try_lock() else {
            log_debug!(self.info.address, "Maintenance busy, skipping tick");
            return;
        };
        self.run_tick().await;
    }

    // Order matters: a dead predecessor is cleared before stabilize reads it.
    async fn run_tick(&self) {
        self.check_predecessor().await;
        self.fix_fingers().await;
        self.stabilize().await;
    }

    pub async fn check_predecessor(&self) {
        let Some(predecessor) = self.predecessor() else {
            return;
        };

        if let Err(e) = self.ping(&predecessor).await {
            let cleared = {
                let mut current = self.predecessor.lock();
                if current.as_ref() == Some(&predecessor) {
                    *current = None;
                    true
                } else {
                    false
                }
            };
            if cleared {
                log_warn!(
                    self.info.address,
                    "Predecessor {} is dead ({}). Cleared.",
                    predecessor.address,
                    e
                );
            }
        }
    }

    /// Refreshes the finger under the cursor and advances the cursor, even
    /// when the lookup fails.
    pub async fn fix_fingers(&self) {
        let index = {
            let mut cursor = self.maintenance.finger_cursor.lock();
            let index = *cursor % M;
            *cursor = (index + 1) % M;
            index
        };

        let target = add_power_of_two(&self.info.id, index);
        match self.find_successor(target).await {
            Ok(successor) => {
                if let Some(finger) = self.finger_table.lock().get_mut(index) {
                    *finger = successor;
                }
            }
            Err(e) => {
                log_debug!(self.info.address, "Failed to fix finger {}: {}", index, e);
            }
        }
    }

    pub fn finger_cursor(&self) -> usize {
        *self.maintenance.finger_cursor.lock()
    }

    /// Reconciles the successor list with the ring, then notifies the
    /// (possibly new) immediate successor.
    pub async fn stabilize(&self) {
        let old = self.successor_list();

        let mut rebuilt = None;
        for candidate in old.iter().take(self.successor_list_len) {
            match self.stabilize_from(candidate).await {
                Ok(list) => {
                    rebuilt = Some(list);
                    break;
                }
                Err(e) => {
                    log_debug!(
                        self.info.address,
                        "Stabilize: successor {} unreachable: {}",
                        candidate.address,
                        e
                    );
                }
            }
        }

        let new = match rebuilt {
            Some(list) => list,
            None => {
                log_warn!(
                    self.info.address,
                    "Lost every successor, falling back to a single-node ring"
                );
                vec![self.info.clone(); self.successor_list_len]
            }
        };

        if new != old {
            *self.successors.lock() = new.clone();
            self.debug_ring_state();
        }

        let successor = new.first().cloned().unwrap_or_else(|| self.info.clone());
        if let Err(e) = self.notify_peer(&successor).await {
            log_debug!(
                self.info.address,
                "Failed to notify successor {}: {}",
                successor.address,
                e
            );
        }

        let addresses = |nodes: &[NodeInfo]| -> Vec<String> {
            nodes.iter().map(|n| n.address.clone()).collect()
        };
        let (up, down) =
            events::successor_changes(&addresses(&old), &addresses(&new), &self.info.address);
        if !down.is_empty() {
            self.emit(RingEvent::SuccessorDown(down));
        }
        if !up.is_empty() {
            self.emit(RingEvent::SuccessorUp(up));
        }
    }

    // Builds a successor list through `candidate`, preferring a node that
    // has joined between us and it.
    async fn stabilize_from(&self, candidate: &NodeInfo) -> chordal_lib::Result<Vec<NodeInfo>> {
        let (reported_predecessor, reported_successors) = self.fetch_state(candidate).await?;
        // Our own list is what is being rebuilt
        let reported_successors = if self.is_self(candidate) {
            Vec::new()
        } else {
            reported_successors
        };

        if let Some(predecessor) = reported_predecessor {
            if !self.is_self(&predecessor)
                && is_between(&predecessor.id, &self.info.id, &candidate.id)
            {
                match self.fetch_state(&predecessor).await {
                    Ok((_, successors)) => {
                        log_debug!(
                            self.info.address,
                            "Stabilize: adopting {} which joined before {}",
                            predecessor.address,
                            candidate.address
                        );
                        return Ok(self.build_successor_list(predecessor, successors));
                    }
                    Err(e) => {
                        log_debug!(
                            self.info.address,
                            "Stabilize: reported predecessor {} unreachable: {}",
                            predecessor.address,
                            e
                        );
                    }
                }
            }
        }

        Ok(self.build_successor_list(candidate.clone(), reported_successors))
    }

    /// `[head] + tail`, cut where the tail wraps back to us and padded with
    /// ourselves to the configured length.
    pub(crate) fn build_successor_list(&self, head: NodeInfo, tail: Vec<NodeInfo>) -> Vec<NodeInfo> {
        let mut list = Vec::with_capacity(self.successor_list_len);
        list.push(head);
        for node in tail {
            if list.len() >= self.successor_list_len || self.is_self(&node) {
                break;
            }
            list.push(node);
        }
        list.resize(self.successor_list_len, self.info.clone());
        list
    }
}

use chordal_lib::{hash, parse_address, short_id, ChordError, DhtMessage, Entry, NodeId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

use crate::events::{self, RingEvent};
use crate::maintenance::Maintenance;
use crate::network_client::{self, NetworkClient};

/// Finger table length, one entry per bit of the identifier space.
pub const M: usize = chordal_lib::ID_BITS;

/// A peer as seen locally: its address and the id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
}

impl NodeInfo {
    pub fn new(address: &str) -> Result<Self> {
        let address = parse_address(address)?;
        Ok(Self {
            id: hash(address.as_bytes()),
            address,
        })
    }

    // Addresses received from peers; a bad one means the peer misbehaved.
    pub(crate) fn from_peer(address: &str) -> Result<Self> {
        Self::new(address).map_err(|e| {
            ChordError::ProtocolViolation(format!("peer sent bad address '{}': {}", address, e))
        })
    }
}

pub struct ChordNode<T: NetworkClient> {
    pub info: NodeInfo,
    pub(crate) successor_list_len: usize,
    pub(crate) predecessor: Arc<Mutex<Option<NodeInfo>>>,
    pub(crate) successors: Arc<Mutex<Vec<NodeInfo>>>,
    pub(crate) finger_table: Arc<Mutex<Vec<NodeInfo>>>,
    pub(crate) data: Arc<Mutex<HashMap<NodeId, Vec<u8>>>>,
    pub(crate) network_client: Arc<T>,
    pub(crate) maintenance: Arc<Maintenance>,
    pub(crate) events: broadcast::Sender<RingEvent>,
    // Set by join, cleared by the first inbound notify
    pub(crate) awaiting_first_notify: Arc<AtomicBool>,
    pub(crate) shutdown: Arc<watch::Sender<bool>>,
}

impl<T: NetworkClient> Clone for ChordNode<T> {
    fn clone(&self) -> Self {
        ChordNode {
            info: self.info.clone(),
            successor_list_len: self.successor_list_len,
            predecessor: self.predecessor.clone(),
            successors: self.successors.clone(),
            finger_table: self.finger_table.clone(),
            data: self.data.clone(), // This clones the Arc, not the HashMap
            network_client: self.network_client.clone(),
            maintenance: self.maintenance.clone(),
            events: self.events.clone(),
            awaiting_first_notify: self.awaiting_first_notify.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: NetworkClient> ChordNode<T> {
    /// Creates a node listening as `address` with a successor list of
    /// length `successor_list_len`. The node starts as a single-node ring.
    pub fn new(address: &str, successor_list_len: usize, network_client: Arc<T>) -> Result<Self> {
        if successor_list_len == 0 {
            return Err(ChordError::InvalidArgument(
                "successor list length must be at least 1".to_string(),
            ));
        }
        let info = NodeInfo::new(address)?;

        Ok(ChordNode {
            successor_list_len,
            predecessor: Arc::new(Mutex::new(None)),
            successors: Arc::new(Mutex::new(vec![info.clone(); successor_list_len])),
            finger_table: Arc::new(Mutex::new(vec![info.clone(); M])),
            data: Arc::new(Mutex::new(HashMap::new())),
            network_client,
            maintenance: Arc::new(Maintenance::default()),
            events: events::channel(),
            awaiting_first_notify: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(watch::channel(false).0),
            info,
        })
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn address(&self) -> &str {
        &self.info.address
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.predecessor.lock().clone()
    }

    /// The immediate successor (`successor[0]`).
    pub fn successor(&self) -> NodeInfo {
        self.successors
            .lock()
            .first()
            .cloned()
            .unwrap_or_else(|| self.info.clone())
    }

    pub fn successor_list(&self) -> Vec<NodeInfo> {
        self.successors.lock().clone()
    }

    pub fn finger_table(&self) -> Vec<NodeInfo> {
        self.finger_table.lock().clone()
    }

    pub fn successor_list_len(&self) -> usize {
        self.successor_list_len
    }

    /// True once this node points at some other node as its successor.
    pub fn is_joined(&self) -> bool {
        self.successor().address != self.info.address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RingEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: RingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn is_self(&self, peer: &NodeInfo) -> bool {
        peer.address == self.info.address
    }

    /// Resets to the degenerate single-node ring.
    pub fn start_new_network(&self) {
        *self.successors.lock() = vec![self.info.clone(); self.successor_list_len];
        *self.predecessor.lock() = None;
        *self.finger_table.lock() = vec![self.info.clone(); M];
        self.awaiting_first_notify
            .store(false, std::sync::atomic::Ordering::SeqCst);
        log_info!(self.info.address, "Started new network. I am the only node.");
    }

    fn state_snapshot(&self, predecessor: bool, successor: bool, finger: bool) -> DhtMessage {
        let addresses = |nodes: &[NodeInfo]| nodes.iter().map(|n| n.address.clone()).collect();
        DhtMessage::State {
            predecessor: if predecessor {
                self.predecessor.lock().as_ref().map(|p| p.address.clone())
            } else {
                None
            },
            successor: successor.then(|| addresses(&self.successors.lock())),
            finger: finger.then(|| addresses(&self.finger_table.lock())),
        }
    }

    /// Serves one inbound request. Every failure is folded into a
    /// `DhtMessage::Error` reply.
    pub async fn handle_message(&self, message: DhtMessage) -> DhtMessage {
        let result = match message {
            DhtMessage::Ping { sender } => {
                parse_address(&sender).map(|sender| DhtMessage::Pong { sender })
            }
            DhtMessage::GetState {
                predecessor,
                successor,
                finger,
            } => Ok(self.state_snapshot(predecessor, successor, finger)),
            DhtMessage::Lookup { id } => self
                .find_successor(id)
                .await
                .map(|successor| DhtMessage::FoundSuccessor {
                    successor: successor.address,
                }),
            DhtMessage::Notify { sender } => match NodeInfo::new(&sender) {
                Ok(sender) => {
                    self.notify(sender).await;
                    Ok(DhtMessage::Ack)
                }
                Err(e) => Err(e),
            },
            DhtMessage::Get { id } => self.get_local(&id).map(|value| DhtMessage::Value { value }),
            DhtMessage::Set { id, value } => self.set_local(id, value).map(|_| DhtMessage::Ack),
            DhtMessage::Delete { id } => {
                self.delete_local(&id).map(|value| DhtMessage::Value { value })
            }
            DhtMessage::Partition { bound, delete } => self
                .serve_partition(bound, delete)
                .map(|entries| DhtMessage::Entries { entries }),
            DhtMessage::All { sender } => parse_address(&sender).map(|_| DhtMessage::Entries {
                entries: self.local_entries(),
            }),
            DhtMessage::Merge {
                sender,
                predecessor,
                entries,
            } => self
                .accept_handoff(&sender, predecessor.as_deref(), entries)
                .map(|absorbed| DhtMessage::Merged {
                    absorbed: absorbed as u64,
                }),
            other => Err(ChordError::ProtocolViolation(format!(
                "unsupported request: {:?}",
                other
            ))),
        };

        result.unwrap_or_else(|e| {
            log_debug!(self.info.address, "Rejecting request: {}", e);
            DhtMessage::Error(e)
        })
    }

    /// Accepts peer connections until the node leaves.
    pub async fn serve(&self, bind_address: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_address).await.map_err(|e| {
            ChordError::InvalidArgument(format!("failed to bind {}: {}", bind_address, e))
        })?;
        log_info!(
            self.info.address,
            "Chord Node {} listening on {}",
            hex::encode(self.info.id),
            bind_address
        );

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, _)) => {
                        let node = self.clone();
                        tokio::spawn(async move {
                            node.handle_connection(socket).await;
                        });
                    }
                    Err(e) => {
                        log_error!(self.info.address, "Failed to accept connection: {}", e);
                    }
                },
                _ = shutdown.changed() => {
                    log_info!(self.info.address, "RPC listener stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) {
        let message = match network_client::read_message(&mut socket).await {
            Ok(message) => message,
            Err(e) => {
                log_error!(self.info.address, "Failed to read request: {}", e);
                return;
            }
        };
        log_debug!(self.info.address, "Received message: {:?}", message);

        let response = self.handle_message(message).await;
        let encoded = match network_client::encode(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                log_error!(self.info.address, "Failed to encode response: {}", e);
                return;
            }
        };
        if let Err(e) = socket.write_all(&encoded).await {
            log_error!(self.info.address, "Failed to write response to socket: {}", e);
        }
    }

    /// Confirms a peer is alive. Pinging ourselves always succeeds.
    pub(crate) async fn ping(&self, peer: &NodeInfo) -> Result<()> {
        if self.is_self(peer) {
            return Ok(());
        }
        let reply = self
            .network_client
            .call_node(
                &peer.address,
                DhtMessage::Ping {
                    sender: self.info.address.clone(),
                },
            )
            .await?;
        match reply {
            DhtMessage::Pong { .. } => Ok(()),
            other => Err(unexpected_reply(&peer.address, other)),
        }
    }

    /// A peer's `(predecessor, successor list)`; read locally for ourselves.
    pub(crate) async fn fetch_state(
        &self,
        peer: &NodeInfo,
    ) -> Result<(Option<NodeInfo>, Vec<NodeInfo>)> {
        if self.is_self(peer) {
            return Ok((self.predecessor(), self.successor_list()));
        }

        let reply = self
            .network_client
            .call_node(
                &peer.address,
                DhtMessage::GetState {
                    predecessor: true,
                    successor: true,
                    finger: false,
                },
            )
            .await?;

        match reply {
            DhtMessage::State {
                predecessor,
                successor: Some(successor),
                ..
            } if !successor.is_empty() => {
                let predecessor = predecessor
                    .as_deref()
                    .map(NodeInfo::from_peer)
                    .transpose()?;
                let successor = successor
                    .iter()
                    .map(|address| NodeInfo::from_peer(address))
                    .collect::<Result<Vec<_>>>()?;
                Ok((predecessor, successor))
            }
            other => Err(unexpected_reply(&peer.address, other)),
        }
    }

    /// Tells a peer we believe we are its predecessor.
    pub(crate) async fn notify_peer(&self, peer: &NodeInfo) -> Result<()> {
        if self.is_self(peer) {
            self.notify(self.info.clone()).await;
            return Ok(());
        }
        let reply = self
            .network_client
            .call_node(
                &peer.address,
                DhtMessage::Notify {
                    sender: self.info.address.clone(),
                },
            )
            .await?;
        match reply {
            DhtMessage::Ack => Ok(()),
            other => Err(unexpected_reply(&peer.address, other)),
        }
    }

    /// Snapshot of locally held entries.
    pub fn local_entries(&self) -> Vec<Entry> {
        self.data
            .lock()
            .iter()
            .map(|(id, value)| Entry {
                id: *id,
                value: value.clone(),
            })
            .collect()
    }

    pub fn debug_ring_state(&self) {
        let predecessor = self.predecessor();
        let successors = self.successor_list();

        log_debug!(
            self.info.address,
            "Ring state: self={}, pred={}, succ=[{}]",
            short_id(&self.info.id),
            predecessor
                .as_ref()
                .map(|p| short_id(&p.id))
                .unwrap_or_else(|| "None".to_string()),
            successors
                .iter()
                .map(|s| short_id(&s.id))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}

/// Maps a reply that is not the expected variant to an error. Remote
/// rejections keep their kind.
pub(crate) fn unexpected_reply(address: &str, reply: DhtMessage) -> ChordError {
    match reply {
        DhtMessage::Error(e) => e,
        other => ChordError::ProtocolViolation(format!(
            "unexpected reply from {}: {:?}",
            address, other
        )),
    }
}

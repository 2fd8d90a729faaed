use chordal_lib::{hash, is_between, is_between_right_inclusive, short_id, ChordError, DhtMessage, NodeId, Result};

use crate::network_client::NetworkClient;
use crate::node::{unexpected_reply, ChordNode, NodeInfo};

impl<T: NetworkClient> ChordNode<T> {
    /// Resolves the node owning `id`. The returned node has answered a
    /// liveness check on the terminal hop.
    pub async fn find_successor(&self, id: NodeId) -> Result<NodeInfo> {
        if id == self.info.id {
            return Ok(self.info.clone());
        }

        let successors = self.successor_list();
        let first = successors.first().cloned().unwrap_or_else(|| self.info.clone());
        if self.is_self(&first) {
            // Degenerate single-node ring
            return Ok(self.info.clone());
        }

        if is_between_right_inclusive(&id, &self.info.id, &first.id) {
            // A dead successor's range falls to the next live one
            for successor in &successors {
                if self.is_self(successor) {
                    return Ok(self.info.clone());
                }
                match self.ping(successor).await {
                    Ok(()) => return Ok(successor.clone()),
                    Err(e) => log_debug!(
                        self.info.address,
                        "Successor {} failed liveness check: {}",
                        successor.address,
                        e
                    ),
                }
            }
            return Err(ChordError::PeerUnreachable(format!(
                "no live successor for {}",
                short_id(&id)
            )));
        }

        for candidate in self.closest_preceding_nodes(id) {
            match self.forward_lookup(&candidate, id).await {
                Ok(owner) => return Ok(owner),
                Err(e) => log_debug!(
                    self.info.address,
                    "Lookup hop {} failed: {}",
                    candidate.address,
                    e
                ),
            }
        }

        log_warn!(
            self.info.address,
            "Every routing candidate for {} is unreachable",
            short_id(&id)
        );
        Err(ChordError::PeerUnreachable(format!(
            "lookup for {} exhausted all candidates",
            short_id(&id)
        )))
    }

    /// Resolves the owner of an application key.
    pub async fn lookup(&self, key: &[u8]) -> Result<NodeInfo> {
        self.find_successor(hash(key)).await
    }

    // Finds the node in the finger table that most immediately precedes `id`.
    pub fn closest_preceding_node(&self, id: NodeId) -> NodeInfo {
        self.closest_preceding_nodes(id)
            .into_iter()
            .next()
            .unwrap_or_else(|| self.info.clone())
    }

    /// Routing candidates strictly between this node and `id`, best first:
    /// fingers from the highest index down, then the successor list.
    pub(crate) fn closest_preceding_nodes(&self, id: NodeId) -> Vec<NodeInfo> {
        let fingers = self.finger_table();
        let successors = self.successor_list();

        let mut candidates: Vec<NodeInfo> = Vec::new();
        for node in fingers.iter().rev().chain(successors.iter()) {
            if self.is_self(node)
                || !is_between(&node.id, &self.info.id, &id)
                || candidates.iter().any(|c| c.address == node.address)
            {
                continue;
            }
            candidates.push(node.clone());
        }
        candidates
    }

    async fn forward_lookup(&self, candidate: &NodeInfo, id: NodeId) -> Result<NodeInfo> {
        let reply = self
            .network_client
            .call_node(&candidate.address, DhtMessage::Lookup { id })
            .await?;
        match reply {
            DhtMessage::FoundSuccessor { successor } => NodeInfo::from_peer(&successor),
            other => Err(unexpected_reply(&candidate.address, other)),
        }
    }
}

use crate::integration::test_harness::{HarnessResult, TestNode};
use crate::integration::{NetworkInvariants, TestHarness};
use chordal_lib::hash;
use chordal_node::NodeInfo;
use futures::future::join_all;
use std::time::Duration;

/// Common test scenarios for DHT network integration testing
pub struct TestScenarios;

fn ensure(condition: bool, message: impl Into<String>) -> HarnessResult<()> {
    if condition {
        Ok(())
    } else {
        let message: String = message.into();
        Err(message.into())
    }
}

pub fn test_keys(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| format!("key-{}", i).into_bytes()).collect()
}

impl TestScenarios {
    /// Every live node resolves every key to the node that owns it.
    pub async fn verify_lookups(harness: &TestHarness, keys: &[Vec<u8>]) -> HarnessResult<()> {
        let nodes = harness.live_nodes().await;
        for key in keys {
            let expected = harness
                .expected_owner_of_key(key)
                .await
                .ok_or("no live nodes")?;
            let results = join_all(nodes.iter().map(|node| node.lookup(key))).await;
            for (node, result) in nodes.iter().zip(results) {
                let owner = result.map_err(|e| format!("lookup from {} failed: {}", node.address(), e))?;
                ensure(
                    owner.address == expected,
                    format!(
                        "{} resolved {:?} to {} instead of {}",
                        node.address(),
                        String::from_utf8_lossy(key),
                        owner.address,
                        expected
                    ),
                )?;
            }
        }
        Ok(())
    }

    /// Polls until every key sits on its owner only.
    pub async fn wait_for_key_placement(
        harness: &TestHarness,
        keys: &[Vec<u8>],
        attempts: usize,
    ) -> HarnessResult<()> {
        for _ in 0..attempts {
            if NetworkInvariants::check_key_placement(harness, keys).await.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let violations = NetworkInvariants::check_key_placement(harness, keys).await;
        Err(format!("keys misplaced: {:?}", violations).into())
    }

    async fn node(harness: &TestHarness, address: &str) -> HarnessResult<TestNode> {
        harness
            .get_node(address)
            .await
            .ok_or_else(|| format!("Node {} not found", address).into())
    }

    /// A lone node is its own successor and owns every id.
    pub async fn single_node_ring() -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let address = harness.add_node(8000).await?;
        harness.create_network(&address).await?;
        harness.run_rounds(1).await;

        let node = Self::node(&harness, &address).await?;
        ensure(node.successor().address == address, "successor is not self")?;
        for id in [[0u8; 20], [0xffu8; 20], hash(b"anything")] {
            let owner = node.find_successor(id).await?;
            ensure(owner.address == address, "lookup did not return self")?;
        }
        let violations = NetworkInvariants::check_all(&harness).await;
        ensure(violations.is_empty(), format!("{:?}", violations))
    }

    /// Two nodes end up as each other's successor and predecessor.
    pub async fn two_node_ring() -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let a = harness.add_node(8000).await?;
        let b = harness.add_node(8001).await?;
        harness.create_network(&a).await?;
        harness.join(&b, &a).await?;
        harness.wait_for_stabilization(10).await?;

        let (node_a, node_b) = (Self::node(&harness, &a).await?, Self::node(&harness, &b).await?);
        ensure(node_a.successor().address == b, "a.successor != b")?;
        ensure(node_b.successor().address == a, "b.successor != a")?;
        ensure(node_a.predecessor().map(|p| p.address) == Some(b.clone()), "a.predecessor != b")?;
        ensure(node_b.predecessor().map(|p| p.address) == Some(a.clone()), "b.predecessor != a")?;

        Self::verify_lookups(&harness, &test_keys(20)).await
    }

    /// A alone, B joins via A, both agree on the owner of "k".
    pub async fn concrete_join_scenario() -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let a = harness.add_node(8000).await?;
        let b = harness.add_node(8001).await?;
        harness.create_network(&a).await?;
        harness.run_rounds(1).await;

        let node_a = Self::node(&harness, &a).await?;
        let node_b = Self::node(&harness, &b).await?;
        ensure(node_a.successor().address == a, "a alone is not its own successor")?;

        harness.join(&b, &a).await?;
        ensure(node_b.successor().address == a, "b.successor != a right after join")?;

        harness.wait_for_stabilization(10).await?;
        ensure(node_a.predecessor().map(|p| p.address) == Some(b.clone()), "a.predecessor != b")?;
        ensure(node_a.successor().address == b, "a.successor != b")?;

        node_a.set(b"k", b"v".to_vec()).await?;
        ensure(node_b.get(b"k").await? == Some(b"v".to_vec()), "b cannot read k")?;
        let (from_a, from_b) = (node_a.lookup(b"k").await?, node_b.lookup(b"k").await?);
        ensure(from_a == from_b, "a and b disagree on the owner of k")?;
        Self::wait_for_key_placement(&harness, &[b"k".to_vec()], 50).await
    }

    /// Nodes join one by one through the first node; the ring converges
    /// and lookups agree from every node.
    pub async fn ring_convergence(count: u16) -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let addresses = harness.add_nodes(8000, count).await?;
        harness.build_ring(&addresses, 2).await?;
        harness.wait_for_stabilization(40).await?;

        // Let the fingers fill in, then route through them
        harness.run_rounds(10).await;
        Self::verify_lookups(&harness, &test_keys(32)).await
    }

    /// Two nodes join back to back between the same neighbours.
    pub async fn concurrent_joins() -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let addresses = harness.add_nodes(8000, 5).await?;
        let (initial, joiners) = addresses.split_at(2);
        harness.build_ring(initial, 3).await?;
        harness.wait_for_stabilization(20).await?;

        for joiner in joiners {
            harness.join(joiner, &initial[0]).await?;
        }
        harness.wait_for_stabilization(40).await?;
        Self::verify_lookups(&harness, &test_keys(16)).await
    }

    /// A crashed node drops out of every successor list within two rounds
    /// and the ring heals around it.
    pub async fn node_failure_recovery() -> HarnessResult<()> {
        let mut harness = TestHarness::with_successor_list_len(3);
        let addresses = harness.add_nodes(8000, 5).await?;
        harness.build_ring(&addresses, 2).await?;
        harness.wait_for_stabilization(40).await?;

        let ring = harness.live_addresses().await;
        let victim = ring.get(2).ok_or("ring too small")?.clone();
        harness.fail_node(&victim).await?;

        harness.run_rounds(2).await;
        let dead = NetworkInvariants::check_no_dead_references(&harness).await;
        // The predecessor pointer of the victim's successor is repaired by notify
        ensure(dead.is_empty(), format!("stale references: {:?}", dead))?;

        harness.wait_for_stabilization(10).await?;
        Self::verify_lookups(&harness, &test_keys(16)).await
    }

    /// Keys stored before a join move to the new owner once it is fully
    /// joined, without loss or duplication.
    pub async fn key_migration_on_join() -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let addresses = harness.add_nodes(8000, 3).await?;
        let keys = test_keys(24);

        harness.create_network(&addresses[0]).await?;
        harness.run_rounds(1).await;
        let first = Self::node(&harness, &addresses[0]).await?;
        for key in &keys {
            first.set(key, key.clone()).await?;
        }

        for joiner in &addresses[1..] {
            harness.join(joiner, &addresses[0]).await?;
            harness.wait_for_stabilization(20).await?;
            Self::wait_for_key_placement(&harness, &keys, 100).await?;
        }

        for node in harness.live_nodes().await {
            for key in &keys {
                ensure(
                    node.get(key).await? == Some(key.clone()),
                    format!("{} cannot read {:?}", node.address(), String::from_utf8_lossy(key)),
                )?;
            }
        }
        Ok(())
    }

    /// A leaving node hands its keys to its successor.
    pub async fn graceful_leave() -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let addresses = harness.add_nodes(8000, 4).await?;
        let keys = test_keys(24);
        harness.build_ring(&addresses, 2).await?;
        harness.wait_for_stabilization(40).await?;

        let first = Self::node(&harness, &addresses[0]).await?;
        for key in &keys {
            first.set(key, key.clone()).await?;
        }
        Self::wait_for_key_placement(&harness, &keys, 10).await?;

        let leaver = addresses.get(1).ok_or("ring too small")?;
        harness.leave(leaver).await?;
        Self::wait_for_key_placement(&harness, &keys, 10).await?;

        harness.wait_for_stabilization(10).await?;
        for key in &keys {
            ensure(
                first.get(key).await? == Some(key.clone()),
                format!("{:?} lost after leave", String::from_utf8_lossy(key)),
            )?;
        }
        Ok(())
    }

    /// Re-delivering a notify from the current predecessor changes nothing.
    pub async fn repeated_notify_is_idempotent() -> HarnessResult<()> {
        let mut harness = TestHarness::new();
        let addresses = harness.add_nodes(8000, 3).await?;
        harness.build_ring(&addresses, 2).await?;
        harness.wait_for_stabilization(20).await?;

        for node in harness.live_nodes().await {
            let predecessor = node.predecessor().ok_or("missing predecessor")?;
            let before = (node.predecessor(), node.successor_list());
            for _ in 0..5 {
                node.notify(NodeInfo::new(&predecessor.address)?).await;
            }
            ensure(
                (node.predecessor(), node.successor_list()) == before,
                format!("notify changed the state of {}", node.address()),
            )?;
        }
        Ok(())
    }
}

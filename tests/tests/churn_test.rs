use chordal_integration_tests::integration::{NetworkInvariants, TestHarness, TestScenarios};

#[tokio::test]
async fn test_node_failure_recovery() {
    TestScenarios::node_failure_recovery()
        .await
        .expect("The ring should heal around a crashed node");
}

#[tokio::test]
async fn test_graceful_leave() {
    TestScenarios::graceful_leave()
        .await
        .expect("A leaving node should hand off its keys");
}

#[tokio::test]
async fn test_losing_every_successor_falls_back_to_self() {
    let mut harness = TestHarness::with_successor_list_len(2);
    let addresses = harness.add_nodes(8000, 3).await.unwrap();
    harness.build_ring(&addresses, 2).await.unwrap();
    harness.wait_for_stabilization(20).await.unwrap();

    let survivor = addresses[0].clone();
    for address in &addresses[1..] {
        harness.fail_node(address).await.unwrap();
    }
    harness.run_rounds(2).await;

    let node = harness.get_node(&survivor).await.unwrap();
    assert_eq!(node.successor().address, survivor);
    assert!(NetworkInvariants::check_all(&harness).await.is_empty());
    assert_eq!(node.lookup(b"anything").await.unwrap().address, survivor);
}

#[tokio::test]
async fn test_lookup_fails_when_ring_is_gone() {
    let mut harness = TestHarness::with_successor_list_len(1);
    let addresses = harness.add_nodes(8000, 3).await.unwrap();
    harness.build_ring(&addresses, 2).await.unwrap();
    harness.wait_for_stabilization(20).await.unwrap();

    let node = harness.get_node(&addresses[0]).await.unwrap();
    for address in &addresses[1..] {
        harness.fail_node(address).await.unwrap();
    }

    // Without maintenance the node still points at dead peers
    let successor = node.successor();
    let past_successor = chordal_lib::add_power_of_two(&successor.id, 0);
    let result = node.find_successor(past_successor).await;
    assert!(matches!(
        result,
        Err(chordal_lib::ChordError::PeerUnreachable(_))
    ));
}

#[tokio::test]
async fn test_recovered_node_is_linked_back_in() {
    let mut harness = TestHarness::new();
    let addresses = harness.add_nodes(8000, 4).await.unwrap();
    harness.build_ring(&addresses, 2).await.unwrap();
    harness.wait_for_stabilization(30).await.unwrap();

    let flaky = harness.live_addresses().await[1].clone();
    harness.fail_node(&flaky).await.unwrap();
    harness.run_rounds(2).await;

    harness.network().mark_node_recovered(&flaky).await;
    harness.wait_for_stabilization(30).await.unwrap();
    assert_eq!(harness.live_nodes().await.len(), 4);

    let flaky_node = harness.get_node(&flaky).await.unwrap();
    let predecessor = flaky_node.predecessor().unwrap();
    assert!(harness.is_claimed_by(&flaky, &flaky_node.id()).await);
    assert!(!harness.is_claimed_by(&flaky, &predecessor.id).await);
}

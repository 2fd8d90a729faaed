use chordal_integration_tests::integration::{NetworkInvariants, TestHarness, TestScenarios};
use chordal_node::RingEvent;

#[tokio::test]
async fn test_key_migration_on_join() {
    TestScenarios::key_migration_on_join()
        .await
        .expect("Keys should move to the new owner");
}

#[tokio::test]
async fn test_joined_fires_once_after_first_notify() {
    let mut harness = TestHarness::new();
    let a = harness.add_node(8000).await.unwrap();
    let b = harness.add_node(8001).await.unwrap();
    harness.create_network(&a).await.unwrap();
    harness.run_rounds(1).await;

    let node_b = harness.get_node(&b).await.unwrap();
    let mut events = node_b.subscribe();
    harness.join(&b, &a).await.unwrap();
    harness.wait_for_stabilization(10).await.unwrap();
    harness.run_rounds(3).await;

    let mut joined = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RingEvent::Joined { successor } = event {
            joined.push(successor);
        }
    }
    assert_eq!(joined, vec![a]);
}

#[tokio::test]
async fn test_values_survive_growth() {
    let mut harness = TestHarness::new();
    let addresses = harness.add_nodes(8000, 6).await.unwrap();
    let keys = chordal_integration_tests::integration::scenarios::test_keys(40);

    harness.build_ring(&addresses[..2], 3).await.unwrap();
    harness.wait_for_stabilization(20).await.unwrap();
    let entry = harness.get_node(&addresses[0]).await.unwrap();
    for key in &keys {
        entry.set(key, key.clone()).await.unwrap();
    }

    for address in &addresses[2..] {
        harness.join(address, &addresses[0]).await.unwrap();
        harness.wait_for_stabilization(30).await.unwrap();
        TestScenarios::wait_for_key_placement(&harness, &keys, 100)
            .await
            .unwrap();
    }

    assert!(NetworkInvariants::check_key_placement(&harness, &keys)
        .await
        .is_empty());
    let last = harness.get_node(&addresses[5]).await.unwrap();
    for key in &keys {
        assert_eq!(last.get(key).await.unwrap(), Some(key.clone()));
        assert!(last.delete(key).await.unwrap().is_some());
    }
    for key in &keys {
        assert!(harness.holders_of(key).await.is_empty());
    }
}

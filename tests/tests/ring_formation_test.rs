use chordal_integration_tests::integration::TestScenarios;

#[tokio::test]
async fn test_single_node_ring() {
    TestScenarios::single_node_ring()
        .await
        .expect("A lone node should own the whole ring");
}

#[tokio::test]
async fn test_two_node_ring() {
    TestScenarios::two_node_ring()
        .await
        .expect("Two nodes should link to each other");
}

#[tokio::test]
async fn test_concrete_join_scenario() {
    TestScenarios::concrete_join_scenario()
        .await
        .expect("B joining via A should converge");
}

#[tokio::test]
async fn test_three_node_convergence() {
    TestScenarios::ring_convergence(3)
        .await
        .expect("Three nodes should converge");
}

#[tokio::test]
async fn test_eight_node_convergence() {
    TestScenarios::ring_convergence(8)
        .await
        .expect("Eight nodes should converge");
}

#[tokio::test]
async fn test_concurrent_joins() {
    TestScenarios::concurrent_joins()
        .await
        .expect("Back-to-back joins should converge");
}

#[tokio::test]
async fn test_repeated_notify_is_idempotent() {
    TestScenarios::repeated_notify_is_idempotent()
        .await
        .expect("Repeated notify should not change state");
}

use super::*;

#[test]
fn honest_header_ranges() {
    let chain = MockChain::linear(100);

    let forward = chain.headers_from(Height(10), 5, false);
    assert_eq!(
        forward.iter().map(|h| h.number.0).collect::<Vec<_>>(),
        vec![10, 11, 12, 13, 14],
    );
    for pair in forward.windows(2) {
        assert_eq!(pair[1].parent_hash, pair[0].hash());
    }

    let reverse = chain.headers_from(Height(10), 5, true);
    assert_eq!(
        reverse.iter().map(|h| h.number.0).collect::<Vec<_>>(),
        vec![10, 9, 8, 7, 6],
    );

    // Requests past the tip are clamped to what the chain has.
    assert_eq!(chain.headers_from(Height(98), 10, false).len(), 3);
    assert!(chain.headers_from(Height(200), 10, false).is_empty());
}

#[test]
fn anchored_skip_list_ranges() {
    let chain = MockChain::linear(100);
    let anchor = chain.header_at(Height(10)).expect("height 10 exists");

    let skip = chain.headers_anchored(&anchor.hash(), 4, 10, false);
    assert_eq!(
        skip.iter().map(|h| h.number.0).collect::<Vec<_>>(),
        vec![10, 20, 30, 40],
    );

    assert!(chain.headers_anchored(&Hash([7; 32]), 4, 10, false).is_empty());
}

#[test]
fn bodies_match_their_headers() {
    let chain = MockChain::linear(10);

    let header = chain.header_at(Height(3)).expect("height 3 exists");
    let block = chain.block_for(&header.hash()).expect("the body exists");

    assert_eq!(block.hash(), header.hash());
    assert_eq!(block.height(), Height(3));
    assert!(chain.block_for(&Hash([7; 32])).is_none());
}

#[tokio::test]
async fn peers_are_busy_until_their_response_is_consumed() {
    let chain = MockChain::linear(10);
    let pool = MockPeerPool::honest(1, &chain);

    let peer = pool.any_idle().expect("the peer starts idle");
    let response = peer
        .send_get_block_headers(Height(1), 5, false)
        .expect("the peer accepts the request");

    assert!(
        pool.any_idle().is_none(),
        "a peer with an outstanding request is not idle",
    );

    let headers = response.await.expect("the honest response resolves");
    assert_eq!(headers.len(), 5);
    assert!(pool.any_idle().is_some(), "the peer is idle again");
}

#[tokio::test]
async fn dropped_peers_leave_the_pool() {
    let chain = MockChain::linear(10);
    let pool = MockPeerPool::honest(2, &chain);

    let first = pool.any_idle().expect("some peer is idle");
    first.drop_connection();

    let second = pool.any_idle().expect("the other peer is still idle");
    assert_ne!(first.node_id(), second.node_id());
    assert!(pool.by_node_id(&first.node_id()).is_none());
    assert!(
        first.send_get_block_headers(Height(1), 1, false).is_none(),
        "dropped peers refuse requests",
    );

    pool.close().expect("closing the mock pool never fails");
    assert!(pool.is_closed());
    assert!(pool.any_idle().is_none());
}

#[tokio::test]
async fn corrupt_peers_break_the_requested_link() {
    let chain = MockChain::linear(10);
    let peer =
        MockPeer::new(1, chain).with_headers_behavior(PeerBehavior::CorruptParentAt(Height(5)));

    let headers = peer
        .send_get_block_headers(Height(1), 8, false)
        .expect("the peer accepts the request")
        .await
        .expect("the response resolves");

    let tampered = headers.iter().find(|h| h.number == Height(5)).expect("height 5 served");
    assert_eq!(tampered.parent_hash, Hash([0xaa; 32]));
}

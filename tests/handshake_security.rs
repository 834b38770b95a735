mod common;

use chainmesh::ledger::Ledger;
use chainmesh::network::message::Payload;
use chainmesh::types::Transaction;
use common::{test_config, wait_until, RawPeer, TestNode};
use std::net::IpAddr;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_sends_handshake_first() {
    let node = TestNode::with_height(4).await;
    let mut peer = RawPeer::connect(&node.p2p_addr()).await;

    let first = peer.recv(WAIT).await.unwrap();
    match first.payload {
        Payload::Handshake(handshake) => {
            assert_eq!(handshake.height, 4);
            assert_eq!(handshake.node_id, first.sender_id);
        }
        other => panic!("expected handshake, got {:?}", other),
    }

    peer.handshake(1).await.unwrap();
    assert!(wait_until(WAIT, || async { node.ready_peers() == 1 }).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_before_handshake_closes_connection() {
    let node = TestNode::with_height(2).await;
    let mut peer = RawPeer::connect(&node.p2p_addr()).await;
    assert!(peer.recv(WAIT).await.unwrap().payload.is_handshake());

    peer.send(Payload::GetChain).await.unwrap();
    peer.expect_closed(WAIT).await;
    assert!(wait_until(WAIT, || async { node.handle.transport.registry().peer_count() == 0 }).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_dropped_after_handshake_timeout() {
    let mut config = test_config();
    config.transport.handshake_timeout_secs = 1;
    let node = TestNode::start(config, chainmesh::types::build_chain(1)).await;

    let mut peer = RawPeer::connect(&node.p2p_addr()).await;
    assert!(peer.recv(WAIT).await.unwrap().payload.is_handshake());
    peer.expect_closed(WAIT).await;
    assert_eq!(node.ready_peers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_violations_ban_the_ip() {
    let mut config = test_config();
    config.security.reset_storm_threshold = 2;
    let node = TestNode::start(config, chainmesh::types::build_chain(1)).await;
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    for _ in 0..2 {
        let mut peer = RawPeer::connect(&node.p2p_addr()).await;
        assert!(peer.recv(WAIT).await.unwrap().payload.is_handshake());
        peer.send(Payload::GetPeers).await.unwrap();
        peer.expect_closed(WAIT).await;
    }
    let gate = node.handle.transport.gate().clone();
    assert!(wait_until(WAIT, || async { gate.is_banned(localhost).is_some() }).await);

    // Refused before any handshake is sent
    let mut peer = RawPeer::connect(&node.p2p_addr()).await;
    assert!(peer.recv(WAIT).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bandwidth_overflow_disconnects() {
    let mut config = test_config();
    config.security.peer_inbound_bytes_per_window = 4096;
    let node = TestNode::start(config, chainmesh::types::build_chain(1)).await;

    let mut peer = RawPeer::connect(&node.p2p_addr()).await;
    assert!(peer.recv(WAIT).await.unwrap().payload.is_handshake());
    peer.handshake(1).await.unwrap();
    assert!(wait_until(WAIT, || async { node.ready_peers() == 1 }).await);

    let bulky = Transaction::new(vec![7u8; 8 * 1024]);
    peer.send(Payload::Transaction(bulky.clone())).await.unwrap();
    peer.expect_closed(WAIT).await;

    assert!(wait_until(WAIT, || async { node.handle.transport.registry().peer_count() == 0 }).await);
    assert!(!node.ledger.has_transaction(&bulky.id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_self_connection_is_dropped() {
    let node = TestNode::with_height(1).await;
    let result = node.handle.transport.connect(&node.p2p_addr()).await;
    assert!(result.is_ok());

    // Both ends see our own node id and close without banning
    assert!(wait_until(WAIT, || async { node.handle.transport.registry().peer_count() == 0 }).await);
    assert_eq!(node.ready_peers(), 0);
    assert!(node
        .handle
        .transport
        .gate()
        .is_banned("127.0.0.1".parse().unwrap())
        .is_none());
}

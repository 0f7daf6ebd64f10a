//! Network integration tests
//!
//! Drives real sockets against the network manager and two full nodes:
//! handshake acceptance and rejection, ping liveness, and block and
//! transaction gossip between peers.

use crossbeam_channel::unbounded;
use serde_json::Deserializer;
use std::io::{BufReader, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use trustchain::utils::{hex_encode, new_key_pair, public_key_from_pkcs8};
use trustchain::{
    GenesisEntry, HandshakePayload, Message, MessagePayload, NetworkManager, NetworkSettings,
    Node, NodeConfig, Transaction, TxAdmission, PROTOCOL_VERSION,
};

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

fn settings(listen_addr: &str) -> NetworkSettings {
    NetworkSettings {
        listen_addr: listen_addr.to_string(),
        bootstrap_peers: Vec::new(),
        max_inbound: 8,
        max_outbound: 8,
        max_dial_attempts: 2,
        dial_retry_backoff_ms: 200,
        ping_interval_secs: 1,
        handshake_timeout_secs: 2,
        sync_interval_secs: 1,
    }
}

fn start_manager(listen_addr: &str) -> (Arc<NetworkManager>, crossbeam_channel::Receiver<trustchain::NetworkEvent>) {
    let (tx, rx) = unbounded();
    let manager = Arc::new(NetworkManager::new(
        settings(listen_addr),
        "test-node".to_string(),
        Arc::new(AtomicU64::new(0)),
        tx,
    ));
    Arc::clone(&manager).start().unwrap();
    (manager, rx)
}

fn handshake_message(node_id: Option<&str>) -> Message {
    Message::new(MessagePayload::Handshake(HandshakePayload {
        version: Some(PROTOCOL_VERSION),
        node_id: node_id.map(str::to_string),
        listen_addr: None,
        height: Some(0),
    }))
    .unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn handshake_without_node_id_closes_the_connection() {
    let addr = free_addr();
    let (manager, _events) = start_manager(&addr);

    let mut stream = TcpStream::connect(&addr).unwrap();
    serde_json::to_writer(&stream, &handshake_message(None)).unwrap();

    // The manager drops the socket without replying; the read side sees a
    // clean EOF rather than a timeout
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buffer = Vec::new();
    let outcome = stream.read_to_end(&mut buffer);
    assert!(outcome.is_ok(), "connection was not closed: {outcome:?}");
    assert!(buffer.is_empty(), "unexpected reply to a malformed handshake");

    // The peer never became Active, so it never counts
    assert_eq!(manager.peer_count(), 0);

    manager.shutdown();
}

#[test]
fn well_formed_handshake_activates_and_is_answered() {
    let addr = free_addr();
    let (manager, events) = start_manager(&addr);

    let stream = TcpStream::connect(&addr).unwrap();
    serde_json::to_writer(&stream, &handshake_message(Some("remote-1"))).unwrap();

    assert!(wait_until(Duration::from_secs(3), || manager.peer_count() == 1));

    // The accepting side answers with its own handshake, then GET_PEERS
    let reader = BufReader::new(stream.try_clone().unwrap());
    let mut incoming = Deserializer::from_reader(reader).into_iter::<Message>();
    let first = incoming.next().unwrap().unwrap();
    match first.payload {
        MessagePayload::Handshake(hs) => {
            assert!(hs.is_well_formed());
            assert_eq!(hs.node_id.as_deref(), Some("test-node"));
        }
        other => panic!("expected a handshake reply, got {other:?}"),
    }
    let second = incoming.next().unwrap().unwrap();
    assert!(matches!(second.payload, MessagePayload::GetPeers));

    let activated = events
        .recv_timeout(Duration::from_secs(2))
        .expect("expected a PeerActivated event");
    assert!(matches!(
        activated,
        trustchain::NetworkEvent::PeerActivated { .. }
    ));

    manager.shutdown();
}

#[test]
fn silent_peer_is_disconnected_after_ping_timeout() {
    let addr = free_addr();
    let (manager, _events) = start_manager(&addr);

    let stream = TcpStream::connect(&addr).unwrap();
    serde_json::to_writer(&stream, &handshake_message(Some("sleeper"))).unwrap();
    assert!(wait_until(Duration::from_secs(3), || manager.peer_count() == 1));

    // Never answer the pings: silence beyond 2x the interval drops us
    assert!(wait_until(Duration::from_secs(8), || manager.peer_count() == 0));

    manager.shutdown();
}

/// Two full nodes sharing a genesis: a transaction submitted to the second
/// node gossips to the first, the first forges it into a block, and the
/// block propagates back.
#[test]
fn transaction_and_block_gossip_between_two_nodes() {
    let dir1 = tempdir().unwrap();
    let dir2 = tempdir().unwrap();
    let addr1 = free_addr();
    let addr2 = free_addr();

    let sender_key = new_key_pair().unwrap();
    let sender = hex_encode(&public_key_from_pkcs8(&sender_key).unwrap());
    let genesis = vec![GenesisEntry {
        address: sender.clone(),
        amount: 1_000_000,
    }];

    let mut config1 = NodeConfig {
        data_dir: dir1.path().to_path_buf(),
        genesis: genesis.clone(),
        ..NodeConfig::default()
    };
    config1.network = settings(&addr1);

    let mut node1 = Node::new(config1).unwrap();

    // The second node must share the first node's genesis block
    std::fs::create_dir_all(dir2.path().join("chain")).unwrap();
    std::fs::copy(
        dir1.path().join("chain").join("0.json"),
        dir2.path().join("chain").join("0.json"),
    )
    .unwrap();

    let mut config2 = NodeConfig {
        data_dir: dir2.path().to_path_buf(),
        genesis,
        ..NodeConfig::default()
    };
    config2.network = settings(&addr2);
    config2.network.bootstrap_peers = vec![addr1.clone()];

    let mut node2 = Node::new(config2).unwrap();
    assert_eq!(node1.height(), 0);
    assert_eq!(node2.height(), 0);
    assert_eq!(node1.balance(&sender), 1_000_000);
    assert_eq!(node2.balance(&sender), 1_000_000);

    node1.start().unwrap();
    node2.start().unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            node1.peer_count() == 1 && node2.peer_count() == 1
        }),
        "nodes failed to connect"
    );

    // Submit to node2; node1 must learn it through gossip
    let tx = Transaction::new_signed(&sender_key, "B".to_string(), 250, 3, None, 0).unwrap();
    assert_eq!(node2.submit_transaction(tx).unwrap(), TxAdmission::Accepted);
    assert!(
        wait_until(Duration::from_secs(10), || node1.mempool_size() == 1),
        "transaction did not gossip to node1"
    );

    // node1 forges; the block must reach node2
    node1.forge_block().unwrap();
    assert_eq!(node1.height(), 1);
    assert!(
        wait_until(Duration::from_secs(10), || node2.height() == 1),
        "block did not gossip to node2"
    );

    assert_eq!(node2.balance("B"), 250);
    assert_eq!(node2.balance(&sender), 1_000_000 - 253);
    assert_eq!(node2.mempool_size(), 0);

    node1.stop();
    node2.stop();
}

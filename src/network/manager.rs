use crate::config::NetworkSettings;
use crate::core::{Block, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::{
    HandshakePayload, Message, MessagePayload, Peer, PeerDirection, PeerInfo, PeerState,
};
use log::{debug, info, warn};
use serde_json::Deserializer;
use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Typed events handed to the node's dispatch loop. Everything the ledger
/// must see crosses this channel; peer bookkeeping stays inside the
/// manager.
#[derive(Debug)]
pub enum NetworkEvent {
    PeerActivated {
        peer_id: String,
        height: Option<u64>,
    },
    PeerDisconnected {
        peer_id: String,
    },
    BlockReceived {
        peer_id: String,
        block: Block,
    },
    BlocksReceived {
        peer_id: String,
        blocks: Vec<Block>,
    },
    TransactionReceived {
        peer_id: String,
        transaction: Transaction,
    },
    BlocksRequested {
        peer_id: String,
        from: u64,
        to: u64,
    },
    TransactionsRequested {
        peer_id: String,
    },
}

/// Owns every peer session: dialing with capped retries, accept limits,
/// the handshake deadline, ping liveness, and fan-out broadcast. Inbound
/// chain traffic is forwarded over the event channel; peer discovery
/// messages are answered here from the manager's own address book.
pub struct NetworkManager {
    settings: NetworkSettings,
    node_id: String,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    known_addrs: RwLock<HashSet<String>>,
    dial_attempts: RwLock<HashMap<String, u32>>,
    dialing: RwLock<HashSet<String>>,
    local_height: Arc<AtomicU64>,
    events: crossbeam_channel::Sender<NetworkEvent>,
    shutdown: Arc<AtomicBool>,
    // Set by start(); lets &self methods hand an owning reference to the
    // threads they spawn
    self_ref: RwLock<Weak<NetworkManager>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkManager {
    pub fn new(
        settings: NetworkSettings,
        node_id: String,
        local_height: Arc<AtomicU64>,
        events: crossbeam_channel::Sender<NetworkEvent>,
    ) -> NetworkManager {
        NetworkManager {
            settings,
            node_id,
            peers: RwLock::new(HashMap::new()),
            known_addrs: RwLock::new(HashSet::new()),
            dial_attempts: RwLock::new(HashMap::new()),
            dialing: RwLock::new(HashSet::new()),
            local_height,
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
            self_ref: RwLock::new(Weak::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn strong_self(&self) -> Option<Arc<NetworkManager>> {
        self.self_ref.read().ok()?.upgrade()
    }

    /// Bind the listener, start the accept and liveness threads, and dial
    /// the bootstrap peers.
    pub fn start(self: Arc<Self>) -> Result<()> {
        if let Ok(mut slot) = self.self_ref.write() {
            *slot = Arc::downgrade(&self);
        }

        let listener = TcpListener::bind(&self.settings.listen_addr).map_err(|e| {
            BlockchainError::Network(format!(
                "Failed to bind to {}: {e}",
                self.settings.listen_addr
            ))
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| BlockchainError::Network(format!("Failed to set nonblocking: {e}")))?;
        info!("Listening on {}", self.settings.listen_addr);

        let manager = Arc::clone(&self);
        let accept_handle = thread::spawn(move || manager.accept_loop(listener));

        let manager = Arc::clone(&self);
        let liveness_handle = thread::spawn(move || manager.liveness_loop());

        if let Ok(mut handles) = self.handles.lock() {
            handles.push(accept_handle);
            handles.push(liveness_handle);
        }

        for addr in self.settings.bootstrap_peers.clone() {
            if let Ok(mut known) = self.known_addrs.write() {
                known.insert(addr.clone());
            }
            self.dial(addr);
        }

        Ok(())
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    if self.inbound_count() >= self.settings.max_inbound {
                        warn!("Rejecting connection from {addr}: inbound limit reached");
                        drop(stream);
                        continue;
                    }
                    debug!("Accepted connection from {addr}");
                    if let Err(e) = self.register_peer(stream, addr, PeerDirection::Inbound) {
                        warn!("Failed to register inbound peer {addr}: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("Error accepting connection: {e}");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Dial an address in the background, retrying with a fixed backoff up
    /// to the configured attempt cap. Exhausted addresses are not retried
    /// again automatically.
    pub fn dial(&self, addr: String) {
        if addr == self.settings.listen_addr {
            return;
        }
        if self.outbound_count() >= self.settings.max_outbound {
            debug!("Not dialing {addr}: outbound limit reached");
            return;
        }
        if self.is_connected_to(&addr) {
            return;
        }
        if let Ok(attempts) = self.dial_attempts.read() {
            if attempts.get(&addr).copied().unwrap_or(0) >= self.settings.max_dial_attempts {
                debug!("Not dialing {addr}: attempt cap exhausted");
                return;
            }
        }
        if let Ok(mut dialing) = self.dialing.write() {
            if !dialing.insert(addr.clone()) {
                return; // Dial already in flight
            }
        }

        let manager = match self.strong_self() {
            Some(manager) => manager,
            None => return, // Not started
        };
        thread::spawn(move || {
            manager.dial_with_retry(&addr);
            if let Ok(mut dialing) = manager.dialing.write() {
                dialing.remove(&addr);
            }
        });
    }

    fn dial_with_retry(&self, addr: &str) {
        let socket_addr: SocketAddr = match addr.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Invalid peer address {addr}: {e}");
                return;
            }
        };

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let attempt = {
                let mut attempts = match self.dial_attempts.write() {
                    Ok(attempts) => attempts,
                    Err(_) => return,
                };
                let entry = attempts.entry(addr.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };

            match TcpStream::connect_timeout(&socket_addr, Duration::from_millis(5000)) {
                Ok(stream) => {
                    info!("Connected to peer {addr} (attempt {attempt})");
                    if let Ok(mut attempts) = self.dial_attempts.write() {
                        attempts.remove(addr);
                    }
                    match self.register_peer(stream, socket_addr, PeerDirection::Outbound) {
                        Ok(peer) => {
                            // The dialing side opens the handshake
                            if self.send_handshake(&peer).is_err() {
                                self.remove_peer(peer.get_id(), "handshake send failed");
                            }
                        }
                        Err(e) => warn!("Failed to register outbound peer {addr}: {e}"),
                    }
                    return;
                }
                Err(e) => {
                    if attempt >= self.settings.max_dial_attempts {
                        warn!("Giving up on peer {addr} after {attempt} attempt(s): {e}");
                        return;
                    }
                    debug!("Dial attempt {attempt} to {addr} failed: {e}");
                    thread::sleep(Duration::from_millis(self.settings.dial_retry_backoff_ms));
                }
            }
        }
    }

    fn register_peer(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        direction: PeerDirection,
    ) -> Result<Arc<Peer>> {
        let manager = self.strong_self().ok_or_else(|| {
            BlockchainError::Network("Network manager is not started".to_string())
        })?;

        let peer = Arc::new(Peer::new(stream, addr, direction)?);
        let reader = peer.reader_stream()?;
        {
            let mut peers = self
                .peers
                .write()
                .map_err(|_| BlockchainError::Network("Peer map lock poisoned".to_string()))?;
            peers.insert(peer.get_id().to_string(), Arc::clone(&peer));
        }

        let session = Arc::clone(&peer);
        thread::spawn(move || manager.reader_loop(session, reader));
        Ok(peer)
    }

    /// Per-peer reader. One JSON value per message; a value that is valid
    /// JSON but not a protocol message is logged and dropped with the
    /// connection left open, while a broken stream ends the session.
    fn reader_loop(self: Arc<Self>, peer: Arc<Peer>, stream: TcpStream) {
        let reader = BufReader::new(stream);
        let values = Deserializer::from_reader(reader).into_iter::<serde_json::Value>();

        for value in values {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let value = match value {
                Ok(value) => value,
                Err(e) => {
                    debug!("Peer {} stream ended: {e}", peer.get_addr());
                    break;
                }
            };
            peer.touch();
            let message: Message = match serde_json::from_value(value) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping unparseable message from {}: {e}", peer.get_addr());
                    continue;
                }
            };
            if !self.handle_message(&peer, message) {
                return; // Peer removed by the handler
            }
        }

        self.remove_peer(peer.get_id(), "connection closed");
    }

    /// Returns false when the peer was removed and the reader must stop
    fn handle_message(&self, peer: &Arc<Peer>, message: Message) -> bool {
        match message.payload {
            MessagePayload::Handshake(handshake) => self.handle_handshake(peer, handshake),
            MessagePayload::Ping => {
                if self.send_payload(peer, MessagePayload::Pong).is_err() {
                    self.remove_peer(peer.get_id(), "pong send failed");
                    return false;
                }
                true
            }
            MessagePayload::Pong => true,
            MessagePayload::GetPeers => {
                let addrs = self.known_addresses();
                if self
                    .send_payload(peer, MessagePayload::Peers { addrs })
                    .is_err()
                {
                    self.remove_peer(peer.get_id(), "peers send failed");
                    return false;
                }
                true
            }
            MessagePayload::Peers { addrs } => {
                for addr in addrs {
                    let newly_known = self
                        .known_addrs
                        .write()
                        .map(|mut known| known.insert(addr.clone()))
                        .unwrap_or(false);
                    if newly_known && addr != self.settings.listen_addr {
                        self.dial(addr);
                    }
                }
                true
            }
            payload => {
                if !peer.is_active() {
                    warn!(
                        "Ignoring {} message from {} before handshake",
                        payload_name(&payload),
                        peer.get_addr()
                    );
                    return true;
                }
                self.forward_event(peer, payload);
                true
            }
        }
    }

    fn handle_handshake(&self, peer: &Arc<Peer>, handshake: HandshakePayload) -> bool {
        if !handshake.is_well_formed() {
            warn!(
                "Malformed handshake from {} (missing version or node id), disconnecting",
                peer.get_addr()
            );
            self.remove_peer(peer.get_id(), "malformed handshake");
            return false;
        }

        let node_id = handshake.node_id.clone().unwrap_or_default();
        let version = handshake.version.unwrap_or_default();
        peer.record_handshake(
            node_id.clone(),
            handshake.listen_addr.clone(),
            version,
            handshake.height,
        );

        if let Some(listen_addr) = handshake.listen_addr {
            if listen_addr != self.settings.listen_addr {
                if let Ok(mut known) = self.known_addrs.write() {
                    known.insert(listen_addr);
                }
            }
        }

        if peer.is_active() {
            return true; // Repeated handshake, identity refreshed above
        }
        peer.set_state(PeerState::Active);
        info!(
            "Peer {} ({}) is active: node {node_id}, version {version}, height {:?}",
            peer.get_id(),
            peer.get_addr(),
            peer.get_height()
        );

        // The accepting side answers with its own handshake
        if peer.get_direction() == PeerDirection::Inbound && self.send_handshake(peer).is_err() {
            self.remove_peer(peer.get_id(), "handshake reply failed");
            return false;
        }
        if self.send_payload(peer, MessagePayload::GetPeers).is_err() {
            self.remove_peer(peer.get_id(), "get_peers send failed");
            return false;
        }

        let _ = self.events.send(NetworkEvent::PeerActivated {
            peer_id: peer.get_id().to_string(),
            height: peer.get_height(),
        });
        true
    }

    fn forward_event(&self, peer: &Arc<Peer>, payload: MessagePayload) {
        let peer_id = peer.get_id().to_string();
        let event = match payload {
            MessagePayload::Block { block } => {
                // Announcing a block is also a height report
                peer.set_height(block.get_index());
                NetworkEvent::BlockReceived { peer_id, block }
            }
            MessagePayload::Blocks { blocks } => NetworkEvent::BlocksReceived { peer_id, blocks },
            MessagePayload::Transaction { transaction } => NetworkEvent::TransactionReceived {
                peer_id,
                transaction,
            },
            MessagePayload::GetBlocks { from, to } => {
                NetworkEvent::BlocksRequested { peer_id, from, to }
            }
            MessagePayload::GetTransactions => NetworkEvent::TransactionsRequested { peer_id },
            // Discovery and liveness are handled before forwarding
            MessagePayload::Handshake(_)
            | MessagePayload::Ping
            | MessagePayload::Pong
            | MessagePayload::GetPeers
            | MessagePayload::Peers { .. } => return,
        };
        let _ = self.events.send(event);
    }

    /// Ping scheduling and the handshake/liveness deadlines. Runs once a
    /// second so the handshake deadline is enforced promptly.
    fn liveness_loop(self: Arc<Self>) {
        let ping_interval = Duration::from_secs(self.settings.ping_interval_secs);
        let handshake_timeout = Duration::from_secs(self.settings.handshake_timeout_secs);
        let ticker = crossbeam_channel::tick(Duration::from_secs(1));
        let mut since_ping = Duration::ZERO;

        loop {
            if ticker.recv().is_err() || self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            since_ping += Duration::from_secs(1);
            let ping_due = since_ping >= ping_interval;
            if ping_due {
                since_ping = Duration::ZERO;
            }

            for peer in self.peer_snapshot() {
                if peer.handshake_expired(handshake_timeout) {
                    warn!("Peer {} handshake timed out", peer.get_addr());
                    self.remove_peer(peer.get_id(), "handshake timeout");
                    continue;
                }
                if !peer.is_active() || !ping_due {
                    continue;
                }
                if peer.silent_for() > ping_interval * 2 {
                    warn!("Peer {} timed out", peer.get_addr());
                    self.remove_peer(peer.get_id(), "ping timeout");
                } else if self.send_payload(&peer, MessagePayload::Ping).is_err() {
                    self.remove_peer(peer.get_id(), "ping send failed");
                }
            }
        }
    }

    fn send_handshake(&self, peer: &Arc<Peer>) -> Result<()> {
        let handshake = HandshakePayload::new(
            self.node_id.clone(),
            self.settings.listen_addr.clone(),
            self.local_height.load(Ordering::SeqCst),
        );
        self.send_payload(peer, MessagePayload::Handshake(handshake))
    }

    fn send_payload(&self, peer: &Arc<Peer>, payload: MessagePayload) -> Result<()> {
        peer.send(&Message::new(payload)?)
    }

    /// Send to one peer by session id
    pub fn send_to(&self, peer_id: &str, payload: MessagePayload) -> Result<()> {
        let peer = self
            .peers
            .read()
            .ok()
            .and_then(|peers| peers.get(peer_id).cloned())
            .ok_or_else(|| BlockchainError::Network(format!("Peer {peer_id} is not connected")))?;
        self.send_payload(&peer, payload)
    }

    /// Fan a payload out to every Active peer except `exclude` (the origin
    /// of the gossip). One failed send never blocks the rest; the count of
    /// successful sends is returned.
    pub fn broadcast(&self, payload: MessagePayload, exclude: Option<&str>) -> usize {
        let mut sent = 0;
        for peer in self.peer_snapshot() {
            if !peer.is_active() || Some(peer.get_id()) == exclude {
                continue;
            }
            match self.send_payload(&peer, payload.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {e}", peer.get_addr());
                    self.remove_peer(peer.get_id(), "broadcast send failed");
                }
            }
        }
        sent
    }

    pub fn broadcast_block(&self, block: Block, exclude: Option<&str>) -> usize {
        self.broadcast(MessagePayload::Block { block }, exclude)
    }

    pub fn broadcast_transaction(&self, transaction: Transaction, exclude: Option<&str>) -> usize {
        self.broadcast(MessagePayload::Transaction { transaction }, exclude)
    }

    /// Drop a peer and, for outbound sessions, schedule a capped reconnect
    fn remove_peer(&self, peer_id: &str, reason: &str) {
        let peer = match self.peers.write() {
            Ok(mut peers) => peers.remove(peer_id),
            Err(_) => None,
        };
        let peer = match peer {
            Some(peer) => peer,
            None => return,
        };
        debug!("Removing peer {} ({reason})", peer.get_addr());
        peer.disconnect();
        let _ = self.events.send(NetworkEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });

        if peer.get_direction() == PeerDirection::Outbound && !self.shutdown.load(Ordering::SeqCst)
        {
            self.dial(peer.get_addr().to_string());
        }
    }

    fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn is_connected_to(&self, addr: &str) -> bool {
        self.peer_snapshot().iter().any(|peer| {
            peer.get_addr().to_string() == addr || peer.get_listen_addr().as_deref() == Some(addr)
        })
    }

    fn inbound_count(&self) -> usize {
        self.peer_snapshot()
            .iter()
            .filter(|peer| peer.get_direction() == PeerDirection::Inbound)
            .count()
    }

    fn outbound_count(&self) -> usize {
        self.peer_snapshot()
            .iter()
            .filter(|peer| peer.get_direction() == PeerDirection::Outbound)
            .count()
    }

    pub fn peer_count(&self) -> usize {
        self.peer_snapshot()
            .iter()
            .filter(|peer| peer.is_active())
            .count()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peer_snapshot().iter().map(|peer| peer.info()).collect()
    }

    fn known_addresses(&self) -> Vec<String> {
        self.known_addrs
            .read()
            .map(|known| known.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The Active peer reporting the greatest height, if any
    pub fn best_peer(&self) -> Option<(String, u64)> {
        self.peer_snapshot()
            .iter()
            .filter(|peer| peer.is_active())
            .filter_map(|peer| peer.get_height().map(|h| (peer.get_id().to_string(), h)))
            .max_by_key(|(_, height)| *height)
    }

    /// Close every socket and stop the background threads
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for peer in self.peer_snapshot() {
            peer.disconnect();
        }
        if let Ok(mut peers) = self.peers.write() {
            peers.clear();
        }
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
        info!("Network manager stopped");
    }
}

fn payload_name(payload: &MessagePayload) -> &'static str {
    match payload {
        MessagePayload::Handshake(_) => "HANDSHAKE",
        MessagePayload::Ping => "PING",
        MessagePayload::Pong => "PONG",
        MessagePayload::GetPeers => "GET_PEERS",
        MessagePayload::Peers { .. } => "PEERS",
        MessagePayload::GetBlocks { .. } => "GET_BLOCKS",
        MessagePayload::Blocks { .. } => "BLOCKS",
        MessagePayload::Block { .. } => "BLOCK",
        MessagePayload::Transaction { .. } => "TRANSACTION",
        MessagePayload::GetTransactions => "GET_TRANSACTIONS",
    }
}

use crate::error::{BlockchainError, Result};
use crate::network::Message;
use log::info;
use serde::Serialize;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

const TCP_WRITE_TIMEOUT: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerDirection {
    Inbound,
    Outbound,
}

/// Session lifecycle. `Disconnected` is terminal; a later reconnect creates
/// a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Disconnected,
}

/// One bidirectional connection to a remote node. The owning manager reads
/// from a cloned stream on a dedicated thread; writes from any thread go
/// through the mutex-guarded handle here, one JSON value per message.
pub struct Peer {
    id: String,
    addr: SocketAddr,
    direction: PeerDirection,
    stream: Mutex<TcpStream>,
    state: Mutex<PeerState>,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
    node_id: Mutex<Option<String>>,
    listen_addr: Mutex<Option<String>>,
    version: Mutex<Option<u32>>,
    height: Mutex<Option<u64>>,
}

/// Read-only snapshot of a peer for status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub addr: String,
    pub direction: PeerDirection,
    pub state: PeerState,
    pub node_id: Option<String>,
    pub version: Option<u32>,
    pub height: Option<u64>,
}

impl Peer {
    pub fn new(stream: TcpStream, addr: SocketAddr, direction: PeerDirection) -> Result<Peer> {
        stream
            .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
            .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;

        Ok(Peer {
            id: Uuid::new_v4().to_string(),
            addr,
            direction,
            stream: Mutex::new(stream),
            state: Mutex::new(PeerState::Handshaking),
            last_seen: Mutex::new(Instant::now()),
            connected_at: Instant::now(),
            node_id: Mutex::new(None),
            listen_addr: Mutex::new(None),
            version: Mutex::new(None),
            height: Mutex::new(None),
        })
    }

    /// Clone of the underlying stream for the reader thread
    pub fn reader_stream(&self) -> Result<TcpStream> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| BlockchainError::Network("Peer stream lock poisoned".to_string()))?;
        stream
            .try_clone()
            .map_err(|e| BlockchainError::Network(format!("Failed to clone peer stream: {e}")))
    }

    /// Serialize one message onto the wire. A failure marks the peer dead to
    /// the caller but does not itself touch peer state.
    pub fn send(&self, message: &Message) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| BlockchainError::Network("Peer stream lock poisoned".to_string()))?;
        serde_json::to_writer(&*stream, message).map_err(|e| {
            BlockchainError::Network(format!("Failed to send message to {}: {e}", self.addr))
        })?;
        Ok(())
    }

    /// Shut the socket down and mark the session terminal
    pub fn disconnect(&self) {
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.set_state(PeerState::Disconnected);
        info!("Disconnected peer {} ({})", self.id, self.addr);
    }

    pub fn state(&self) -> PeerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(PeerState::Disconnected)
    }

    pub fn set_state(&self, new_state: PeerState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new_state;
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    /// Record inbound traffic for liveness tracking
    pub fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    pub fn silent_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last_seen| last_seen.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// True when the session has sat in Handshaking past the deadline
    pub fn handshake_expired(&self, timeout: Duration) -> bool {
        self.state() == PeerState::Handshaking && self.connected_at.elapsed() > timeout
    }

    /// Store the identity the remote reported in its handshake
    pub fn record_handshake(
        &self,
        node_id: String,
        listen_addr: Option<String>,
        version: u32,
        height: Option<u64>,
    ) {
        if let Ok(mut slot) = self.node_id.lock() {
            *slot = Some(node_id);
        }
        if let Ok(mut slot) = self.listen_addr.lock() {
            *slot = listen_addr;
        }
        if let Ok(mut slot) = self.version.lock() {
            *slot = Some(version);
        }
        if let Ok(mut slot) = self.height.lock() {
            *slot = height;
        }
    }

    pub fn set_height(&self, new_height: u64) {
        if let Ok(mut height) = self.height.lock() {
            *height = Some(new_height);
        }
    }

    pub fn get_id(&self) -> &str {
        self.id.as_str()
    }

    pub fn get_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn get_direction(&self) -> PeerDirection {
        self.direction
    }

    pub fn get_listen_addr(&self) -> Option<String> {
        self.listen_addr.lock().ok().and_then(|addr| addr.clone())
    }

    pub fn get_height(&self) -> Option<u64> {
        self.height.lock().ok().and_then(|height| *height)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            addr: self.addr.to_string(),
            direction: self.direction,
            state: self.state(),
            node_id: self.node_id.lock().ok().and_then(|id| id.clone()),
            version: self.version.lock().ok().and_then(|version| *version),
            height: self.get_height(),
        }
    }
}

//! P2P networking
//!
//! Persistent TCP sessions with a handshake state machine, ping liveness,
//! capped dial retries, and JSON-framed protocol messages. The manager owns
//! every session; chain traffic is forwarded to the node as typed events.

pub mod manager;
pub mod message;
pub mod peer;

pub use manager::{NetworkEvent, NetworkManager};
pub use message::{HandshakePayload, Message, MessagePayload, PROTOCOL_VERSION};
pub use peer::{Peer, PeerDirection, PeerInfo, PeerState};

//! # TrustChain - an account-model blockchain node
//!
//! A single-process blockchain node: validator-signed blocks over an
//! account balance model, a fee-ordered mempool, file-per-block
//! persistence, and TCP gossip keeping independent nodes' ledgers
//! consistent.
//!
//! ## Layout
//! - `core/`: transactions, blocks, merkle root, difficulty, the monetary
//!   schedule, and the `Ledger` state machine that gates every mutation
//! - `storage/`: the per-block chain files and the in-memory mempool
//! - `network/`: peer sessions, the wire protocol, and the manager that
//!   owns dialing, limits, liveness, and broadcast
//! - `node/`: the composition root wiring ledger and network together
//! - `config/`: the TOML-backed configuration surface
//! - `utils/`: ring-based crypto wrappers and bincode hash preimages
//! - `cli/`: clap command definitions for the `trustchain` binary

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod node;
pub mod storage;
pub mod utils;

// Re-export commonly used types for convenience
pub use crate::cli::{Command, Opt};
pub use crate::config::{GenesisEntry, NetworkSettings, NodeConfig, ValidatorSettings};
pub use crate::core::{
    Block, BlockAdmission, BlockRejection, GenesisAllocation, Ledger, Transaction, TxAdmission,
    TxVerdict, ZERO_HASH,
};
pub use crate::error::{BlockchainError, Result};
pub use crate::network::{
    HandshakePayload, Message, MessagePayload, NetworkEvent, NetworkManager, PeerInfo, PeerState,
    PROTOCOL_VERSION,
};
pub use crate::node::Node;
pub use crate::storage::{ChainStore, Mempool};

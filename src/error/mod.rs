//! Error handling for the blockchain
//!
//! Ordinary invalidity (a bad transaction or block arriving from a peer) is
//! expected traffic and is reported through the verdict enums in `core::ledger`,
//! not through this type. `BlockchainError` covers the genuinely exceptional
//! paths: corrupt storage, malformed key material, I/O and protocol failures.

use std::fmt;

/// Result type alias for blockchain operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Error types for blockchain operations
#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// Missing or corrupt persisted chain data, or a failed block write.
    /// Fatal at startup; aborts the in-flight append at runtime.
    Storage(String),
    /// Malformed key material during signing or key import
    Key(String),
    /// Cryptographic operation errors other than key handling
    Crypto(String),
    /// Network communication errors
    Network(String),
    /// Transaction construction errors
    Transaction(String),
    /// Block construction errors
    InvalidBlock(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Storage(msg) => write!(f, "Storage error: {msg}"),
            BlockchainError::Key(msg) => write!(f, "Key error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            BlockchainError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

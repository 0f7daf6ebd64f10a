//! Persistence and pending-transaction storage
//!
//! The chain lives on disk as one JSON file per block under the data
//! directory; the mempool is in-memory only. Both are owned by the ledger
//! and mutated exclusively through its serialized entry points.

pub mod chain_store;
pub mod memory_pool;

pub use chain_store::ChainStore;
pub use memory_pool::Mempool;

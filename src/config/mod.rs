//! Configuration management
//!
//! The node's configuration surface: data directory, network addresses and
//! limits, validator identity, and the genesis distribution. Loaded from a
//! TOML file with defaults for everything; the resulting object is passed
//! explicitly into the components that need it.

pub mod settings;

pub use settings::{
    GenesisEntry, NetworkSettings, NodeConfig, ValidatorSettings, DEFAULT_LISTEN_ADDR,
};

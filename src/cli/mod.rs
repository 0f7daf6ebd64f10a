//! Command-line interface definitions
//!
//! Values in, core operations invoked; no chain logic lives here.

pub mod commands;

pub use commands::{Command, Opt};

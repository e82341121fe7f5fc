//! bg-core: Core types, errors and configuration for the Baguette server
//!
//! This crate provides the node lifecycle states, the error taxonomy and the
//! server configuration shared by the server crate and its tools.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::{BaguetteError, ConfigError, RegistryError, SessionError};
pub use types::{flatten_info, FlatInfo, NodeInfo, NodeState};

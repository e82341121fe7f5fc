//! Core error types for the Baguette control plane

use bg_protocol::ProtocolError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::NodeState;

/// Top-level error type
#[derive(Error, Debug)]
pub enum BaguetteError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Node registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport could not be started
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Node registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Node info carried none of the address keys
    #[error("Node info does not contain an address")]
    MissingAddress,

    /// An entry already exists and the coordinator refused to overwrite it
    #[error("NODE ALREADY PRE-REGISTERED: {0}")]
    AlreadyPreregistered(String),

    /// Archived entries are frozen
    #[error("Node {address} is archived, cannot move to {requested}")]
    Archived { address: String, requested: NodeState },

    /// No entry for the given key
    #[error("Node not found: {0}")]
    NotFound(String),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// No active session with the given id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Another session is already active for the address
    #[error("A session is already active for address {0}")]
    AlreadyActive(String),

    /// The coordinator refused the session
    #[error("Session rejected: {0}")]
    Rejected(String),

    /// A correlated read got no reply in time
    #[error("No reply to '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The session terminated while a read was pending
    #[error("Session {0} terminated")]
    Cancelled(String),

    /// The outbound channel to the agent is gone
    #[error("Session {0} is disconnected")]
    Disconnected(String),

    /// Registry error raised while driving the node's lifecycle
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Malformed line or payload
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A coordinator id with no matching configuration
    #[error("No configuration found for coordinator id: {0}")]
    UnknownCoordinatorId(String),

    /// A coordinator kind with no registered factory
    #[error("Unknown coordinator kind: {0}")]
    UnknownCoordinatorKind(String),

    /// Neither the listed coordinators nor the default accept the topology
    #[error("No configured coordinator supports the translation context")]
    NoSupportedCoordinator,
}

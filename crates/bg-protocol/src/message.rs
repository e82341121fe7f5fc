//! Inbound lines sent by node agents
//!
//! Every line an agent writes is parsed once into a [`ClientMessage`] and
//! then dispatched by the session. Lines that match no known prefix are
//! kept verbatim as [`ClientMessage::Other`] so the active coordinator can
//! interpret them.
//!
//! # Grammar
//!
//! | Prefix | Variant |
//! |---|---|
//! | `-HELLO FROM CLIENT:` | [`ClientMessage::Hello`] |
//! | `-INPUT:<id>:<json>` | [`ClientMessage::Input`] |
//! | `SERVER-GET-NODE-SSH-CREDENTIALS <addr>` (any case) | [`ClientMessage::NodeCredentialsQuery`] |
//! | `-NOTIFY-GROUPING-CHANGE:<name>` | [`ClientMessage::GroupingChange`] |
//! | `-NOTIFY-STATUS-CHANGE:<status>` | [`ClientMessage::StatusChange`] |
//! | `-NOTIFY-X:<CMD> <args>` | [`ClientMessage::Notify`] |
//! | `-CLIENT-PROPERTY-CHANGE:<name> <value>` | [`ClientMessage::PropertyChange`] |
//! | `-STATS:<json>` | [`ClientMessage::Stats`] |
//! | `READY` (any case) | [`ClientMessage::Ready`] |

use serde_json::Value;

use crate::error::ProtocolError;
use crate::greeting::{Greeting, GREETING_PREFIX};

pub const INPUT_PREFIX: &str = "-INPUT:";
pub const SERVER_PREFIX: &str = "SERVER-";
pub const NODE_CREDENTIALS_QUERY: &str = "SERVER-GET-NODE-SSH-CREDENTIALS";
pub const GROUPING_CHANGE_PREFIX: &str = "-NOTIFY-GROUPING-CHANGE:";
pub const STATUS_CHANGE_PREFIX: &str = "-NOTIFY-STATUS-CHANGE:";
pub const NOTIFY_PREFIX: &str = "-NOTIFY-X:";
pub const PROPERTY_CHANGE_PREFIX: &str = "-CLIENT-PROPERTY-CHANGE:";
pub const STATS_PREFIX: &str = "-STATS:";
pub const READY: &str = "READY";

/// Severity carried by a log-forwarding notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Body of a `-NOTIFY-X:` line
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Agent-side log line to be re-logged on the server
    Log {
        level: NotifyLevel,
        text: Option<String>,
    },
    /// `RECOVERY GIVE_UP <nodeId>@<address>`: the agent stopped trying to
    /// recover a peer node
    RecoveryGiveUp { node_id: String, address: String },
    /// A give-up notice without the `@<address>` part
    RecoveryMissingAddress(String),
    /// A recovery notice of a type other than `GIVE_UP`
    RecoveryUnknown(String),
    /// A recovery notice lacking its type or its data
    RecoveryInvalid(Option<String>),
    /// Any other notification command
    Unknown(String),
}

/// One parsed line received from an agent
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Hello(Greeting),
    /// Reply to a correlated read
    Input { id: String, value: Value },
    /// Request for the preregistration info of another node
    NodeCredentialsQuery(String),
    /// A `SERVER-` request this server does not answer
    ServerQuery(String),
    GroupingChange(String),
    StatusChange(String),
    Notify(Notification),
    PropertyChange { name: String, value: Option<String> },
    Stats(Value),
    Ready,
    Other(String),
}

impl ClientMessage {
    /// Parse an already trimmed line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if let Some(rest) = line.strip_prefix(GREETING_PREFIX) {
            return Ok(Self::Hello(Greeting::parse(rest)));
        }

        if let Some(rest) = line.strip_prefix(INPUT_PREFIX) {
            let (id, value) = rest
                .split_once(':')
                .ok_or_else(|| ProtocolError::malformed("input", line))?;
            return Ok(Self::Input {
                id: id.trim().to_string(),
                value: serde_json::from_str(value)?,
            });
        }

        if starts_with_ignore_case(line, SERVER_PREFIX) {
            let mut parts = line.splitn(2, ' ');
            let command = parts.next().unwrap_or_default().trim();
            let address = parts.next().map(str::trim).unwrap_or_default();
            if command.eq_ignore_ascii_case(NODE_CREDENTIALS_QUERY) && !address.is_empty() {
                return Ok(Self::NodeCredentialsQuery(address.to_string()));
            }
            return Ok(Self::ServerQuery(line.to_string()));
        }

        if let Some(rest) = line.strip_prefix(GROUPING_CHANGE_PREFIX) {
            return Ok(Self::GroupingChange(rest.trim().to_string()));
        }

        if let Some(rest) = line.strip_prefix(STATUS_CHANGE_PREFIX) {
            return Ok(Self::StatusChange(rest.trim().to_string()));
        }

        if let Some(rest) = line.strip_prefix(NOTIFY_PREFIX) {
            return Ok(Self::Notify(parse_notification(rest.trim())));
        }

        if let Some(rest) = line.strip_prefix(PROPERTY_CHANGE_PREFIX) {
            let mut parts = rest.trim().splitn(2, ' ');
            let name = parts.next().unwrap_or_default().trim().to_string();
            let value = parts.next().map(str::to_string);
            return Ok(Self::PropertyChange { name, value });
        }

        if let Some(rest) = line.strip_prefix(STATS_PREFIX) {
            return Ok(Self::Stats(serde_json::from_str(rest)?));
        }

        if line.eq_ignore_ascii_case(READY) {
            return Ok(Self::Ready);
        }

        Ok(Self::Other(line.to_string()))
    }
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len()
        && line.is_char_boundary(prefix.len())
        && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn parse_notification(message: &str) -> Notification {
    let mut parts = message.splitn(2, ' ');
    let command = parts.next().unwrap_or_default().trim();
    let args = parts.next().map(str::to_string);

    let level = match command.to_ascii_uppercase().as_str() {
        "DEBUG" => Some(NotifyLevel::Debug),
        "INFO" => Some(NotifyLevel::Info),
        "WARN" => Some(NotifyLevel::Warn),
        "ERROR" => Some(NotifyLevel::Error),
        "RECOVERY" => return parse_recovery(args),
        _ => None,
    };

    match level {
        Some(level) => Notification::Log { level, text: args },
        None => Notification::Unknown(message.to_string()),
    }
}

fn parse_recovery(args: Option<String>) -> Notification {
    let raw = args.unwrap_or_default();
    let mut parts = raw.splitn(2, ' ');
    let kind = parts.next().unwrap_or_default().trim();
    let data = parts.next().map(str::trim).unwrap_or_default();

    if kind.is_empty() || data.is_empty() {
        return Notification::RecoveryInvalid(Some(raw.clone()).filter(|r| !r.is_empty()));
    }
    if !kind.eq_ignore_ascii_case("GIVE_UP") {
        return Notification::RecoveryUnknown(raw.clone());
    }

    match data.split_once('@') {
        Some((node_id, address)) if !address.trim().is_empty() => Notification::RecoveryGiveUp {
            node_id: node_id.trim().to_string(),
            address: address.trim().to_string(),
        },
        _ => Notification::RecoveryMissingAddress(raw.clone()),
    }
}

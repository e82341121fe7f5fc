//! Outbound commands written by the server to an agent

use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::payload::{
    encode_payload, ClientConfiguration, ConstantsPayload, GroupingConfiguration,
};

/// A command line sent from the server to an agent
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    SetId(String),
    /// Role names are sent upper-cased
    SetRole(String),
    /// Grouping names are sent upper-cased
    SetActiveGrouping(String),
    SetParams(BTreeMap<String, String>),
    SetClientConfig(ClientConfiguration),
    SetGroupingConfig(GroupingConfiguration),
    SetConstants(BTreeMap<String, f64>),
    /// Sent once the handshake completes
    SendStatsStart,
    Exit(Option<String>),
    Heartbeat(u64),
    /// A read-back request whose reply is `-INPUT:<id>:<json>`
    Correlated { command: String, id: String },
    Raw(String),
}

impl ServerCommand {
    /// Render the command as a single protocol line (without terminator)
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(match self {
            Self::SetId(id) => format!("SET-ID {}", id),
            Self::SetRole(role) => format!("SET-ROLE {}", role.to_uppercase()),
            Self::SetActiveGrouping(grouping) => {
                format!("SET-ACTIVE-GROUPING {}", grouping.to_uppercase())
            }
            Self::SetParams(params) => format!("SET-PARAMS {}", encode_payload(params)?),
            Self::SetClientConfig(config) => {
                format!("SET-CLIENT-CONFIG {}", encode_payload(config)?)
            }
            Self::SetGroupingConfig(config) => {
                format!("SET-GROUPING-CONFIG {}", encode_payload(config)?)
            }
            Self::SetConstants(constants) => format!(
                "SET-CONSTANTS {}",
                encode_payload(&ConstantsPayload {
                    constants: constants.clone(),
                })?
            ),
            Self::SendStatsStart => "SEND-STATS START".to_string(),
            Self::Exit(None) => "EXIT".to_string(),
            Self::Exit(Some(msg)) => format!("EXIT {}", msg),
            Self::Heartbeat(millis) => format!("Heartbeat {}", millis),
            Self::Correlated { command, id } => format!("{} {}", command.trim(), id),
            Self::Raw(line) => line.trim().to_string(),
        })
    }
}

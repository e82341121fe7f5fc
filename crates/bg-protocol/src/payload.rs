//! Structured payloads pushed to agents
//!
//! Configuration pushes (`SET-PARAMS`, `SET-CLIENT-CONFIG`,
//! `SET-GROUPING-CONFIG`, `SET-CONSTANTS`) carry a JSON document wrapped in
//! a versioned envelope:
//!
//! ```text
//! {"version":1,"payload":{...}}
//! ```
//!
//! An agent that receives an envelope with a different version must reject
//! it instead of guessing at the layout.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current payload schema version
pub const PAYLOAD_VERSION: u32 = 1;

/// Versioned wrapper around every structured payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub payload: T,
}

/// Serialize a payload into its single-line envelope form
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<String, ProtocolError> {
    let envelope = Envelope {
        version: PAYLOAD_VERSION,
        payload,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse an envelope, rejecting unknown schema versions
pub fn decode_payload<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    let envelope: Envelope<T> = serde_json::from_str(text)?;
    if envelope.version != PAYLOAD_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            found: envelope.version,
            expected: PAYLOAD_VERSION,
        });
    }
    Ok(envelope.payload)
}

/// How an agent reaches the broker of one grouping level
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConnectionConfig {
    pub grouping: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// Credentials and certificates stay out of logs.
impl fmt::Debug for BrokerConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnectionConfig")
            .field("grouping", &self.grouping)
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A named derived-metric function shared with every grouping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub name: String,
    pub expression: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Everything an agent needs to run the event processing of one grouping
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingConfiguration {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub broker_connections: BTreeMap<String, BrokerConnectionConfig>,
    #[serde(default)]
    pub event_type_names: BTreeSet<String>,
    /// Topic → rules
    #[serde(default)]
    pub rules: BTreeMap<String, BTreeSet<String>>,
    /// Topic → downstream topics
    #[serde(default)]
    pub connections: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub function_definitions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub constants: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_password: Option<String>,
}

impl fmt::Debug for GroupingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupingConfiguration")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .field("broker_connections", &self.broker_connections)
            .field("event_type_names", &self.event_type_names)
            .field("rules", &self.rules)
            .field("connections", &self.connections)
            .field("function_definitions", &self.function_definitions)
            .field("constants", &self.constants)
            .field("broker_username", &self.broker_username)
            .finish_non_exhaustive()
    }
}

/// Agent-wide configuration: collectors and peers that run without an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfiguration {
    #[serde(default)]
    pub nodes_without_client: BTreeSet<String>,
    #[serde(default)]
    pub collector_configurations: BTreeMap<String, serde_json::Value>,
}

/// Payload of `SET-CONSTANTS`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantsPayload {
    pub constants: BTreeMap<String, f64>,
}

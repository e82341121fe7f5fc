//! Core domain types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Structured node information as supplied by callers (nested JSON)
pub type NodeInfo = serde_json::Map<String, Value>;

/// Flattened string map stored on registry entries
pub type FlatInfo = BTreeMap<String, String>;

/// Lifecycle state of a node registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Preregistered,
    IgnoreNode,
    Installing,
    NotInstalled,
    Installed,
    InstallError,
    WaitingRegistration,
    Registering,
    Registered,
    RegistrationError,
    Disconnected,
    Exiting,
    Exited,
    NodeFailed,
    Removing,
    Removed,
    RemoveError,
    Archived,
}

impl NodeState {
    /// All states in lifecycle order
    pub const ALL: [NodeState; 18] = [
        NodeState::Preregistered,
        NodeState::IgnoreNode,
        NodeState::Installing,
        NodeState::NotInstalled,
        NodeState::Installed,
        NodeState::InstallError,
        NodeState::WaitingRegistration,
        NodeState::Registering,
        NodeState::Registered,
        NodeState::RegistrationError,
        NodeState::Disconnected,
        NodeState::Exiting,
        NodeState::Exited,
        NodeState::NodeFailed,
        NodeState::Removing,
        NodeState::Removed,
        NodeState::RemoveError,
        NodeState::Archived,
    ];

    /// Wire/log name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Preregistered => "PREREGISTERED",
            NodeState::IgnoreNode => "IGNORE_NODE",
            NodeState::Installing => "INSTALLING",
            NodeState::NotInstalled => "NOT_INSTALLED",
            NodeState::Installed => "INSTALLED",
            NodeState::InstallError => "INSTALL_ERROR",
            NodeState::WaitingRegistration => "WAITING_REGISTRATION",
            NodeState::Registering => "REGISTERING",
            NodeState::Registered => "REGISTERED",
            NodeState::RegistrationError => "REGISTRATION_ERROR",
            NodeState::Disconnected => "DISCONNECTED",
            NodeState::Exiting => "EXITING",
            NodeState::Exited => "EXITED",
            NodeState::NodeFailed => "NODE_FAILED",
            NodeState::Removing => "REMOVING",
            NodeState::Removed => "REMOVED",
            NodeState::RemoveError => "REMOVE_ERROR",
            NodeState::Archived => "ARCHIVED",
        }
    }

    /// Whether self-healing may try to bring a node in this state back
    pub fn can_recover(&self) -> bool {
        !matches!(
            self,
            NodeState::Preregistered
                | NodeState::IgnoreNode
                | NodeState::Removing
                | NodeState::Removed
                | NodeState::RemoveError
                | NodeState::Archived
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeState::ALL
            .iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| format!("Unknown node state: {}", s))
    }
}

/// Flatten nested node info into dotted keys (`a.b.c`)
///
/// Arrays are flattened by index, strings are taken verbatim and nulls are
/// dropped.
pub fn flatten_info(info: &NodeInfo) -> FlatInfo {
    let mut out = FlatInfo::new();
    for (key, value) in info {
        flatten_value(key, value, &mut out);
    }
    out
}

fn flatten_value(prefix: &str, value: &Value, out: &mut FlatInfo) {
    match value {
        Value::Null => {}
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_value(&format!("{}.{}", prefix, key), nested, out);
            }
        }
        Value::Array(items) => {
            for (i, nested) in items.iter().enumerate() {
                flatten_value(&format!("{}.{}", prefix, i), nested, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Read a string-ish value from node info (numbers and bools are rendered)
pub fn info_str(info: &NodeInfo, key: &str) -> Option<String> {
    match info.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_state_names() {
        assert_eq!(NodeState::NotInstalled.to_string(), "NOT_INSTALLED");
        assert_eq!("ignore_node".parse::<NodeState>().unwrap(), NodeState::IgnoreNode);
        assert!("SLEEPING".parse::<NodeState>().is_err());
        assert_eq!(
            serde_json::to_string(&NodeState::RegistrationError).unwrap(),
            "\"REGISTRATION_ERROR\""
        );
    }

    #[test]
    fn test_can_recover() {
        assert!(NodeState::Registered.can_recover());
        assert!(NodeState::NodeFailed.can_recover());
        assert!(!NodeState::Preregistered.can_recover());
        assert!(!NodeState::Archived.can_recover());
    }

    #[test]
    fn test_flatten_info() {
        let info = json!({
            "id": "vm-1",
            "port": 22,
            "ssh": {"username": "ubuntu", "keys": ["a", "b"]},
            "missing": null
        });
        let flat = flatten_info(info.as_object().unwrap());

        assert_eq!(flat.get("id").map(String::as_str), Some("vm-1"));
        assert_eq!(flat.get("port").map(String::as_str), Some("22"));
        assert_eq!(flat.get("ssh.username").map(String::as_str), Some("ubuntu"));
        assert_eq!(flat.get("ssh.keys.1").map(String::as_str), Some("b"));
        assert!(!flat.contains_key("missing"));
    }
}

//! Monitoring topology consumed from the model compiler
//!
//! A [`TranslationContext`] describes, per grouping level, which event
//! topics exist, which rules process them and how topics feed each other.
//! The server combines it with the global constants, the upperware grouping
//! and the upperware broker endpoint into a [`Topology`], from which the
//! per-grouping configuration pushed to agents is built.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use bg_protocol::{BrokerConnectionConfig, FunctionDefinition, GroupingConfiguration};

/// Known grouping levels, from the widest to the narrowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Grouping {
    Global,
    PerCloud,
    PerRegion,
    PerZone,
    PerHost,
    PerInstance,
}

impl Grouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grouping::Global => "GLOBAL",
            Grouping::PerCloud => "PER_CLOUD",
            Grouping::PerRegion => "PER_REGION",
            Grouping::PerZone => "PER_ZONE",
            Grouping::PerHost => "PER_HOST",
            Grouping::PerInstance => "PER_INSTANCE",
        }
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GLOBAL" => Ok(Grouping::Global),
            "PER_CLOUD" => Ok(Grouping::PerCloud),
            "PER_REGION" => Ok(Grouping::PerRegion),
            "PER_ZONE" => Ok(Grouping::PerZone),
            "PER_HOST" => Ok(Grouping::PerHost),
            "PER_INSTANCE" => Ok(Grouping::PerInstance),
            other => Err(format!("Unknown grouping: {}", other)),
        }
    }
}

/// Sort grouping names from the widest level down
///
/// Names that are not a known [`Grouping`] go last, alphabetically.
pub fn sort_groupings<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
    names.sort_by_key(|name| (name.parse::<Grouping>().ok().map_or(usize::MAX, |g| g as usize), name.clone()));
    names.dedup();
    names
}

/// Output of the metric-model compiler relevant to agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TranslationContext {
    /// Grouping → event topics
    pub g2t: BTreeMap<String, BTreeSet<String>>,
    /// Grouping → topic → rules
    pub g2r: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// Grouping → topic → downstream topics
    pub topic_connections: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    pub function_definitions: Vec<FunctionDefinition>,
}

impl TranslationContext {
    /// Every grouping mentioned anywhere in the context
    pub fn grouping_names(&self) -> BTreeSet<String> {
        self.g2t
            .keys()
            .chain(self.g2r.keys())
            .chain(self.topic_connections.keys())
            .cloned()
            .collect()
    }

    /// Groupings that carry rules, widest first
    pub fn rule_groupings(&self) -> Vec<String> {
        sort_groupings(self.g2r.keys())
    }
}

/// Broker through which agents forward events to the upperware
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerEndpoint {
    pub url: String,
    pub certificate: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Everything a topology reconfiguration applies
#[derive(Debug, Clone)]
pub struct Topology {
    pub context: TranslationContext,
    pub constants: BTreeMap<String, f64>,
    pub upperware_grouping: String,
    pub broker: BrokerEndpoint,
}

impl Topology {
    pub fn new(
        context: TranslationContext,
        constants: BTreeMap<String, f64>,
        upperware_grouping: impl Into<String>,
        broker: BrokerEndpoint,
    ) -> Self {
        Self {
            context,
            constants,
            upperware_grouping: upperware_grouping.into(),
            broker,
        }
    }

    /// Groupings handled by agents (all but the upperware one), widest first
    pub fn groupings(&self) -> Vec<String> {
        let names = self
            .context
            .grouping_names()
            .into_iter()
            .filter(|g| !g.eq_ignore_ascii_case(&self.upperware_grouping));
        sort_groupings(names)
    }

    /// Narrowest agent grouping, used for nodes that run without an agent
    pub fn lowest_level_grouping(&self) -> Option<String> {
        self.groupings().pop()
    }

    /// Build the configuration pushed for one grouping
    pub fn grouping_configuration(
        &self,
        grouping: &str,
        broker_connections: &BTreeMap<String, BrokerConnectionConfig>,
    ) -> GroupingConfiguration {
        GroupingConfiguration {
            name: grouping.to_string(),
            properties: BTreeMap::new(),
            broker_connections: broker_connections.clone(),
            event_type_names: self.context.g2t.get(grouping).cloned().unwrap_or_default(),
            rules: self.context.g2r.get(grouping).cloned().unwrap_or_default(),
            connections: self
                .context
                .topic_connections
                .get(grouping)
                .cloned()
                .unwrap_or_default(),
            function_definitions: self.context.function_definitions.clone(),
            constants: self.constants.clone(),
            broker_username: self.broker.username.clone(),
            broker_password: self.broker.password.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn context() -> TranslationContext {
        let mut tc = TranslationContext::default();
        tc.g2t.insert("GLOBAL".into(), set(&["avg_cpu"]));
        tc.g2t.insert("PER_INSTANCE".into(), set(&["cpu", "mem"]));
        tc.g2r.insert(
            "PER_INSTANCE".into(),
            BTreeMap::from([("cpu".to_string(), set(&["select * from cpu"]))]),
        );
        tc.topic_connections.insert(
            "PER_ZONE".into(),
            BTreeMap::from([("cpu".to_string(), set(&["zone_cpu"]))]),
        );
        tc
    }

    #[test]
    fn test_sort_groupings() {
        let sorted = sort_groupings(["PER_INSTANCE", "CUSTOM", "GLOBAL", "PER_ZONE"]);
        assert_eq!(sorted, vec!["GLOBAL", "PER_ZONE", "PER_INSTANCE", "CUSTOM"]);
    }

    #[test]
    fn test_groupings_exclude_upperware() {
        let topology = Topology::new(context(), BTreeMap::new(), "GLOBAL", BrokerEndpoint::default());
        assert_eq!(topology.groupings(), vec!["PER_ZONE", "PER_INSTANCE"]);
        assert_eq!(topology.lowest_level_grouping().as_deref(), Some("PER_INSTANCE"));
    }

    #[test]
    fn test_grouping_configuration() {
        let topology = Topology::new(
            context(),
            BTreeMap::from([("limit".to_string(), 80.0)]),
            "GLOBAL",
            BrokerEndpoint {
                url: "ssl://upperware:61617".into(),
                username: Some("u".into()),
                password: Some("p".into()),
                certificate: None,
            },
        );

        let cfg = topology.grouping_configuration("PER_INSTANCE", &BTreeMap::new());
        assert_eq!(cfg.name, "PER_INSTANCE");
        assert_eq!(cfg.event_type_names, set(&["cpu", "mem"]));
        assert_eq!(cfg.rules["cpu"], set(&["select * from cpu"]));
        assert!(cfg.connections.is_empty());
        assert_eq!(cfg.constants["limit"], 80.0);
        assert_eq!(cfg.broker_username.as_deref(), Some("u"));
    }

    #[test]
    fn test_grouping_from_str() {
        assert_eq!("per_host".parse::<Grouping>().unwrap(), Grouping::PerHost);
        assert!("PER_GALAXY".parse::<Grouping>().is_err());
        assert!(Grouping::Global < Grouping::PerInstance);
    }
}

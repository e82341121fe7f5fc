//! Named coordinator factories and coordinator selection

use std::collections::BTreeMap;
use std::sync::Arc;

use bg_core::config::ServerConfig;
use bg_core::ConfigError;

use super::{clustering, noop, two_level, CoordinatorParameters, ServerCoordinator};
use super::{ClusteringCoordinator, NoopCoordinator, TwoLevelCoordinator};
use crate::topology::TranslationContext;

/// Builds a coordinator from its configuration parameters
pub type CoordinatorFactory =
    Arc<dyn Fn(&CoordinatorParameters) -> Result<Arc<dyn ServerCoordinator>, ConfigError> + Send + Sync>;

/// Coordinator kinds known to the server, by name
#[derive(Clone, Default)]
pub struct CoordinatorRegistry {
    factories: BTreeMap<String, CoordinatorFactory>,
}

impl CoordinatorRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `noop`, `two-level` and `clustering` kinds
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            noop::NAME,
            Arc::new(|_: &CoordinatorParameters| {
                Ok(Arc::new(NoopCoordinator::new()) as Arc<dyn ServerCoordinator>)
            }),
        );
        registry.register(
            two_level::NAME,
            Arc::new(|_: &CoordinatorParameters| {
                Ok(Arc::new(TwoLevelCoordinator::new()) as Arc<dyn ServerCoordinator>)
            }),
        );
        registry.register(
            clustering::NAME,
            Arc::new(|params: &CoordinatorParameters| {
                Ok(Arc::new(ClusteringCoordinator::from_parameters(params)?) as Arc<dyn ServerCoordinator>)
            }),
        );
        registry
    }

    /// Add or replace the factory for `kind`
    pub fn register(&mut self, kind: &str, factory: CoordinatorFactory) {
        self.factories.insert(kind.trim().to_string(), factory);
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn build(
        &self,
        kind: &str,
        params: &CoordinatorParameters,
    ) -> Result<Arc<dyn ServerCoordinator>, ConfigError> {
        let factory = self
            .factories
            .get(kind.trim())
            .ok_or_else(|| ConfigError::UnknownCoordinatorKind(kind.to_string()))?;
        factory(params)
    }

    /// Pick the coordinator for a topology
    ///
    /// The configured ids are tried in order and the first coordinator that
    /// supports `tc` wins. When none does, the default kind is used, which
    /// must support `tc` too. The returned coordinator is not initialized.
    pub fn select(
        &self,
        config: &ServerConfig,
        tc: &TranslationContext,
    ) -> Result<Arc<dyn ServerCoordinator>, ConfigError> {
        for id in &config.coordinator_ids {
            let id = id.trim();
            if id.is_empty() {
                return Err(ConfigError::Invalid("Blank coordinator id".into()));
            }
            let cfg = config
                .coordinator_configs
                .get(id)
                .ok_or_else(|| ConfigError::UnknownCoordinatorId(id.to_string()))?;
            let coordinator = self.build(&cfg.kind, &cfg.parameters)?;
            if coordinator.is_supported(tc) {
                tracing::info!("Coordinator selected: id={}, kind={}", id, cfg.kind);
                return Ok(coordinator);
            }
            tracing::debug!("Coordinator {} ({}) does not support the translation context", id, cfg.kind);
        }

        let kind = config.coordinator.trim();
        let coordinator = self.build(kind, &config.coordinator_parameters)?;
        if !coordinator.is_supported(tc) {
            tracing::error!("Default coordinator {} does not support the translation context", kind);
            return Err(ConfigError::NoSupportedCoordinator);
        }
        tracing::info!("Default coordinator selected: {}", kind);
        Ok(coordinator)
    }
}

impl std::fmt::Debug for CoordinatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bg_core::config::CoordinatorConfig;
    use std::collections::{BTreeSet, HashMap};

    fn tc(groupings: &[&str]) -> TranslationContext {
        let mut tc = TranslationContext::default();
        for g in groupings {
            tc.g2r.insert(
                g.to_string(),
                BTreeMap::from([("t".to_string(), BTreeSet::from(["r".to_string()]))]),
            );
        }
        tc
    }

    fn config(ids: &[(&str, &str)]) -> ServerConfig {
        let mut config = ServerConfig::default();
        for (id, kind) in ids {
            config.coordinator_ids.push(id.to_string());
            config.coordinator_configs.insert(
                id.to_string(),
                CoordinatorConfig {
                    kind: kind.to_string(),
                    parameters: HashMap::new(),
                },
            );
        }
        config
    }

    #[test]
    fn test_first_supported_id_wins() {
        let registry = CoordinatorRegistry::with_builtins();
        let config = config(&[("a", "clustering"), ("b", "two-level")]);

        let selected = registry.select(&config, &tc(&["GLOBAL", "PER_INSTANCE"])).unwrap();
        assert_eq!(selected.name(), "two-level");

        let selected = registry
            .select(&config, &tc(&["GLOBAL", "PER_ZONE", "PER_INSTANCE"]))
            .unwrap();
        assert_eq!(selected.name(), "clustering");
    }

    #[test]
    fn test_falls_back_to_default_kind() {
        let registry = CoordinatorRegistry::with_builtins();
        let config = config(&[("a", "clustering")]);
        let selected = registry.select(&config, &tc(&["GLOBAL"])).unwrap();
        assert_eq!(selected.name(), "noop");
    }

    #[test]
    fn test_unsupported_default_is_fatal() {
        let registry = CoordinatorRegistry::with_builtins();
        let mut config = config(&[]);
        config.coordinator = "two-level".into();
        assert!(matches!(
            registry.select(&config, &tc(&["GLOBAL"])),
            Err(ConfigError::NoSupportedCoordinator)
        ));
    }

    #[test]
    fn test_configuration_errors() {
        let registry = CoordinatorRegistry::with_builtins();
        let context = tc(&["GLOBAL"]);

        let mut blank = config(&[]);
        blank.coordinator_ids.push("  ".into());
        assert!(matches!(registry.select(&blank, &context), Err(ConfigError::Invalid(_))));

        let mut missing = config(&[]);
        missing.coordinator_ids.push("ghost".into());
        assert!(matches!(
            registry.select(&missing, &context),
            Err(ConfigError::UnknownCoordinatorId(id)) if id == "ghost"
        ));

        let unknown_kind = config(&[("a", "time-window")]);
        assert!(matches!(
            registry.select(&unknown_kind, &context),
            Err(ConfigError::UnknownCoordinatorKind(kind)) if kind == "time-window"
        ));
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = CoordinatorRegistry::new();
        registry.register(
            "custom",
            Arc::new(|_: &CoordinatorParameters| {
                Ok(Arc::new(NoopCoordinator::named("custom")) as Arc<dyn ServerCoordinator>)
            }),
        );
        assert_eq!(registry.kinds(), vec!["custom".to_string()]);
        assert_eq!(registry.build("custom", &HashMap::new()).unwrap().name(), "custom");
        assert!(registry.build("noop", &HashMap::new()).is_err());
    }
}

use courier_core::{CourierError, HandlerRegistry, MessageKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_PENDING: usize = 32;
pub const DEFAULT_SKIPPABLE_RETRY_LIMIT: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_owned() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Reports buffered before the oldest one is dropped.
    pub max_pending: usize,
    /// Failures tolerated on a skippable message before it is skipped.
    pub skippable_retry_limit: u32,
    /// Same for non-skippable messages; unset means they are never skipped.
    pub non_skippable_retry_limit: Option<u32>,
    /// Added to the registry's own non-skippable set.
    pub non_skippable_types: Vec<String>,
    /// Unset keeps the registry's classification of unhandled types.
    pub unknown_types_skippable: Option<bool>,
    /// Zero disables periodic polling.
    pub poll_interval_ms: u64,
    pub supervisor_backoff_ms: u64,
    pub cursor_db_path: Option<String>,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            skippable_retry_limit: DEFAULT_SKIPPABLE_RETRY_LIMIT,
            non_skippable_retry_limit: None,
            non_skippable_types: vec![MessageKind::FulfillIncomingSwap.as_wire().to_owned()],
            unknown_types_skippable: None,
            poll_interval_ms: 10_000,
            supervisor_backoff_ms: 250,
            cursor_db_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(input: &str) -> Result<Self, CourierError> {
        let config: Self =
            toml::from_str(input).map_err(|err| CourierError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, CourierError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| CourierError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), CourierError> {
        if self.max_pending == 0 {
            return Err(CourierError::Config("max_pending must be greater than zero".into()));
        }
        if let Some(bad) = self.non_skippable_types.iter().find(|raw| raw.trim().is_empty()) {
            return Err(CourierError::Config(format!(
                "non_skippable_types contains an empty entry ({bad:?})"
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn supervisor_backoff(&self) -> Duration {
        Duration::from_millis(self.supervisor_backoff_ms)
    }

    /// Merges the skip classification of this config into `registry`. Types
    /// the registry already treats as non-skippable stay that way.
    pub fn classify(&self, registry: &mut HandlerRegistry) {
        for raw in &self.non_skippable_types {
            registry.mark_non_skippable(MessageKind::from_wire(raw));
        }
        if let Some(skippable) = self.unknown_types_skippable {
            registry.set_unknown_skippable(skippable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{HandlerError, NotificationMessage, Skippability};

    #[test]
    fn defaults_are_stable() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_pending, 32);
        assert_eq!(config.skippable_retry_limit, 3);
        assert_eq!(config.non_skippable_retry_limit, None);
        assert_eq!(config.non_skippable_types, vec!["incoming-swap/fulfill".to_owned()]);
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
max_pending = 8
non_skippable_retry_limit = 10
poll_interval_ms = 0

[logging]
level = "debug"
"#,
        )
        .expect("parse");
        assert_eq!(config.max_pending, 8);
        assert_eq!(config.non_skippable_retry_limit, Some(10));
        assert_eq!(config.poll_interval(), None);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.skippable_retry_limit, 3);
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = PipelineConfig::from_toml("max_pending = 0").expect_err("zero capacity");
        assert!(matches!(err, CourierError::Config(reason) if reason.contains("max_pending")));
    }

    #[test]
    fn example_template_parses_back() {
        let template = PipelineConfig::example_toml();
        assert_eq!(PipelineConfig::from_toml(&template).expect("template"), PipelineConfig::default());
    }

    #[test]
    fn classify_merges_into_registry() {
        let config = PipelineConfig {
            non_skippable_types: vec!["operation/new".into()],
            unknown_types_skippable: Some(false),
            ..PipelineConfig::default()
        };
        let mut registry = HandlerRegistry::new();
        registry.register(
            MessageKind::FulfillIncomingSwap,
            |_: &NotificationMessage, _: u64| -> Result<(), HandlerError> { Ok(()) },
        );
        registry.mark_non_skippable(MessageKind::ContactUpdate);
        config.classify(&mut registry);
        assert_eq!(registry.skippability(&MessageKind::NewOperation), Skippability::NonSkippable);
        assert_eq!(registry.skippability(&MessageKind::ContactUpdate), Skippability::NonSkippable);
        assert_eq!(
            registry.skippability(&MessageKind::FulfillIncomingSwap),
            Skippability::NonSkippable
        );
        assert_eq!(
            registry.skippability(&MessageKind::from_wire("wallet/mystery")),
            Skippability::NonSkippable
        );
    }

    #[test]
    fn unset_unknown_flag_keeps_registry_choice() {
        let mut registry = HandlerRegistry::new();
        registry.set_unknown_skippable(false);
        PipelineConfig::default().classify(&mut registry);
        assert_eq!(
            registry.skippability(&MessageKind::from_wire("wallet/mystery")),
            Skippability::NonSkippable
        );
    }
}

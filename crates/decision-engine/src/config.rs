//! Engine configuration.
//!
//! Loaded from an optional YAML/JSON file and overlaid with
//! `DECISION_ENGINE_*` environment variables. Every field has a default, so
//! an empty environment yields a working configuration.

use crate::decision::Vocabulary;
use crate::error::{EngineError, Result};
use crate::parser::Format;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "DECISION_ENGINE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between background snapshot reloads.
    pub refresh_interval_secs: u64,
    /// Deadline for each threat-intel provider lookup.
    pub provider_timeout_ms: u64,
    /// Deadline for each event publish.
    pub publish_timeout_ms: u64,
    pub vocabulary: Vocabulary,
    pub topics: TopicConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            provider_timeout_ms: 2000,
            publish_timeout_ms: 1000,
            vocabulary: Vocabulary::Access,
            topics: TopicConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads `.env`, then the file named by `DECISION_ENGINE_CONFIG` if set,
    /// then applies the environment overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match env::var(format!("{}CONFIG", ENV_PREFIX)) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let format = path
            .to_str()
            .and_then(Format::from_extension)
            .unwrap_or_else(|| Format::detect(&content));
        match format {
            Format::Yaml => Self::from_yaml(&content),
            Format::Json => Self::from_json(&content),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides found through `lookup`, which receives full
    /// variable names such as `DECISION_ENGINE_VOCABULARY`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(value) = get("REFRESH_INTERVAL_SECS") {
            self.refresh_interval_secs = parse_number("REFRESH_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = get("PROVIDER_TIMEOUT_MS") {
            self.provider_timeout_ms = parse_number("PROVIDER_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("PUBLISH_TIMEOUT_MS") {
            self.publish_timeout_ms = parse_number("PUBLISH_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("VOCABULARY") {
            self.vocabulary = match value.trim().to_ascii_lowercase().as_str() {
                "access" | "policy" => Vocabulary::Access,
                "compliance" => Vocabulary::Compliance,
                "classification" => Vocabulary::Classification,
                other => {
                    return Err(EngineError::Config(format!(
                        "{}VOCABULARY must be access, compliance or classification, got '{}'",
                        ENV_PREFIX, other
                    )))
                }
            };
        }
        if let Some(value) = get("LOG_LEVEL") {
            self.telemetry.log_level = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_secs == 0 {
            return Err(EngineError::Config(
                "refresh_interval_secs must be positive".to_string(),
            ));
        }
        if self.provider_timeout_ms == 0 || self.publish_timeout_ms == 0 {
            return Err(EngineError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        EngineError::Config(format!("{}{} must be a non-negative integer", ENV_PREFIX, name))
    })
}

/// Event bus topic names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub block_requests: String,
    pub security_alerts: String,
    pub audit_log: String,
    pub notifications: String,
    pub quarantine: String,
    pub rate_limits: String,
    pub redirects: String,
    pub rule_updates: String,
    pub policy_decisions: String,
    pub risk_assessments: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            block_requests: "block-requests".to_string(),
            security_alerts: "security-alerts".to_string(),
            audit_log: "audit-log".to_string(),
            notifications: "notifications".to_string(),
            quarantine: "quarantine".to_string(),
            rate_limits: "rate-limits".to_string(),
            redirects: "redirects".to_string(),
            rule_updates: "rule-updates".to_string(),
            policy_decisions: "policy-decisions".to_string(),
            risk_assessments: "risk-assessments".to_string(),
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.topics.block_requests, "block-requests");
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            r#"
vocabulary: compliance
topics:
  security_alerts: alerts-v2
"#,
        )
        .unwrap();
        assert_eq!(config.vocabulary, Vocabulary::Compliance);
        assert_eq!(config.topics.security_alerts, "alerts-v2");
        assert_eq!(config.topics.audit_log, "audit-log");
        assert_eq!(config.provider_timeout_ms, 2000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(lookup(&[
                ("DECISION_ENGINE_REFRESH_INTERVAL_SECS", "5"),
                ("DECISION_ENGINE_VOCABULARY", "Classification"),
                ("DECISION_ENGINE_LOG_LEVEL", "debug"),
            ]))
            .unwrap();
        assert_eq!(config.refresh_interval_secs, 5);
        assert_eq!(config.vocabulary, Vocabulary::Classification);
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(lookup(&[("DECISION_ENGINE_PUBLISH_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_zero_interval_invalid() {
        assert!(EngineConfig::from_json(r#"{"refresh_interval_secs": 0}"#).is_err());
    }
}

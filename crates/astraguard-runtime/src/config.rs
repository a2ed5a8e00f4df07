//! Runtime configuration loading.
//!
//! Configuration is read from YAML or JSON, checked against the embedded
//! schema (`schema/runtime-config.schema.json`) and then checked for
//! semantic consistency. Every section has defaults, so an empty document
//! is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

use astraguard_core::{ComponentId, HeuristicConfig, NodeId};

use crate::collaborators::store::PublisherConfig;
use crate::consensus::ConsensusConfig;
use crate::health::HealthConfig;
use crate::orchestrator::EvaluationConfig;
use crate::recovery::RecoveryConfig;
use crate::resilience::{CircuitBreakerConfig, FallbackConfig, RetryPolicy};

/// Embedded runtime configuration schema (loaded at compile time).
const RUNTIME_SCHEMA_JSON: &str = include_str!("../../../schema/runtime-config.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to load schema: {0}")]
    SchemaLoad(String),

    #[error("Config does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Complete configuration of the resilience core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// This node's identity in the cluster and in the coordination store
    pub node_id: NodeId,

    /// Seed for the jitter source; entropy when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_seed: Option<u64>,

    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-component breaker settings
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub circuit_overrides: BTreeMap<ComponentId, CircuitBreakerConfig>,

    /// Retry policy for model calls
    pub retry: RetryPolicy,

    pub evaluation: EvaluationConfig,
    pub health: HealthConfig,
    pub fallback: FallbackConfig,
    pub heuristic: HeuristicConfig,
    pub consensus: ConsensusConfig,
    pub recovery: RecoveryConfig,
    pub publisher: PublisherConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("astraguard-0"),
            jitter_seed: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            circuit_overrides: BTreeMap::new(),
            retry: RetryPolicy::default(),
            evaluation: EvaluationConfig::default(),
            health: HealthConfig::default(),
            fallback: FallbackConfig::default(),
            heuristic: HeuristicConfig::default(),
            consensus: ConsensusConfig::default(),
            recovery: RecoveryConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(content)?;
        Self::from_value(value)
    }

    /// Load and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        Self::from_value(value)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty YAML document parses as null
        let value = if value.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            value
        };

        validate_config_schema(&value)?;
        let config: RuntimeConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.node_id.as_str().is_empty() {
            return invalid("node_id must not be empty".to_string());
        }

        let breakers = std::iter::once((None, &self.circuit_breaker))
            .chain(self.circuit_overrides.iter().map(|(id, cfg)| (Some(id), cfg)));
        for (component, breaker) in breakers {
            let scope = component
                .map(|id| format!("circuit_overrides.{}", id))
                .unwrap_or_else(|| "circuit_breaker".to_string());
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return invalid(format!("{}: thresholds must be at least 1", scope));
            }
            if breaker.max_open_duration < breaker.open_duration {
                return invalid(format!(
                    "{}: max_open_duration must not be shorter than open_duration",
                    scope
                ));
            }
        }

        for (scope, policy) in [("retry", &self.retry), ("consensus.peer_retry", &self.consensus.peer_retry)] {
            if policy.max_attempts == 0 {
                return invalid(format!("{}: max_attempts must be at least 1", scope));
            }
            if policy.backoff.max_delay < policy.backoff.base_delay {
                return invalid(format!("{}: max_delay must not be shorter than base_delay", scope));
            }
        }

        if self.evaluation.model_call_timeout.is_zero() {
            return invalid("evaluation.model_call_timeout must be positive".to_string());
        }
        if self.evaluation.evaluation_deadline < self.evaluation.model_call_timeout {
            return invalid(
                "evaluation.evaluation_deadline must not be shorter than model_call_timeout".to_string(),
            );
        }

        self.health.validate().map_err(ConfigError::Invalid)?;
        self.fallback.validate().map_err(ConfigError::Invalid)?;
        self.heuristic
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("heuristic: {}", e)))?;
        self.recovery.validate().map_err(ConfigError::Invalid)?;

        Ok(())
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Get or initialize the compiled schema validator.
fn get_validator() -> Result<&'static jsonschema::Validator, ConfigError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(RUNTIME_SCHEMA_JSON) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        match jsonschema::options().build(&schema_value) {
            Ok(v) => Ok(v),
            Err(e) => Err(format!("Failed to compile schema: {}", e)),
        }
    });

    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(ConfigError::SchemaLoad(e.clone())),
    }
}

/// Validate a configuration document against the schema.
pub fn validate_config_schema(config_json: &serde_json::Value) -> Result<(), ConfigError> {
    let validator = get_validator()?;

    let errors: Vec<String> = validator
        .iter_errors(config_json)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Schema(errors))
    }
}

/// Serde adapter for durations written as human strings (`"30s"`, `"250ms"`).
pub(crate) mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

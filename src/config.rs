//! Service configuration.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `BUILDLOOP_*` environment variables, then validation.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fix::{FixConfig, PartialApplyPolicy};
use crate::processor::{PayloadSchema, ProcessorConfig};
use crate::scheduler::{BackoffPolicy, QueueOptions};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which built-in handler a queue's workers run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Shell command from the payload.
    #[default]
    Command,
    /// Test run plus self-fix on failure.
    Testing,
}

/// One named queue and its worker set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default)]
    pub phase: PhaseKind,
    /// Parallel workers attached to the queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffPolicy,
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
    /// Payload schema enforced by the processor.
    #[serde(default)]
    pub schema: Option<PayloadSchema>,
}

fn default_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    QueueOptions::default().max_attempts
}

fn default_backoff() -> BackoffPolicy {
    QueueOptions::default().backoff
}

fn default_keep_completed() -> usize {
    QueueOptions::default().keep_completed
}

fn default_keep_failed() -> usize {
    QueueOptions::default().keep_failed
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            phase: PhaseKind::Command,
            concurrency,
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            schema: None,
        }
    }

    pub fn with_phase(mut self, phase: PhaseKind) -> Self {
        self.phase = phase;
        self
    }

    pub fn options(&self) -> QueueOptions {
        QueueOptions::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.backoff)
            .with_retention(self.keep_completed, self.keep_failed)
    }
}

/// The pipeline queues every deployment starts with.
pub fn default_queues() -> Vec<QueueDefinition> {
    vec![
        QueueDefinition::new("generation", 1),
        QueueDefinition::new("build", 3),
        QueueDefinition::new("testing", 5).with_phase(PhaseKind::Testing),
    ]
}

/// Configuration for the whole execution core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Redis URL for the durable job store; in-memory store when absent.
    pub redis_url: Option<String>,
    /// Prefix for every Redis key.
    pub key_prefix: String,
    /// How often idle workers re-check for delayed jobs.
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight work.
    #[serde(with = "duration_ms", rename = "shutdown_grace_ms")]
    pub shutdown_grace: Duration,
    pub queues: Vec<QueueDefinition>,
    pub processor: ProcessorConfig,
    pub fix: FixConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "buildloop".to_string(),
            poll_interval: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(30),
            queues: default_queues(),
            processor: ProcessorConfig::default(),
            fix: FixConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a YAML file; missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if variables have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `path` if given, then the environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `BUILDLOOP_REDIS_URL`: Redis URL for the job store
    /// - `BUILDLOOP_KEY_PREFIX`: Redis key prefix (default: buildloop)
    /// - `BUILDLOOP_POLL_INTERVAL_MS`: Worker poll interval (default: 250)
    /// - `BUILDLOOP_SHUTDOWN_GRACE_MS`: Shutdown grace window (default: 30000)
    /// - `BUILDLOOP_RETRY_LIMIT`: Processor transient retry limit (default: 3)
    /// - `BUILDLOOP_TRANSIENT_PATTERNS`: Comma-separated transient patterns
    /// - `BUILDLOOP_FIX_MAX_ITERATIONS`: Self-fix iterations (default: 5)
    /// - `BUILDLOOP_FIX_ITERATION_TIMEOUT_MS`: Per-iteration budget
    /// - `BUILDLOOP_FIX_ABORT_ON_PARTIAL_APPLY`: Abort iterations on partial patches
    /// - `BUILDLOOP_FIX_MODEL`: Repair model
    /// - `BUILDLOOP_FIX_TEMPERATURE`: Repair temperature
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(val) = lookup("BUILDLOOP_REDIS_URL") {
            self.redis_url = Some(val).filter(|v| !v.is_empty());
        }

        if let Some(val) = lookup("BUILDLOOP_KEY_PREFIX") {
            self.key_prefix = val;
        }

        if let Some(val) = lookup("BUILDLOOP_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "BUILDLOOP_POLL_INTERVAL_MS")?;
            self.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("BUILDLOOP_SHUTDOWN_GRACE_MS") {
            let ms: u64 = parse_env_value(&val, "BUILDLOOP_SHUTDOWN_GRACE_MS")?;
            self.shutdown_grace = Duration::from_millis(ms);
        }

        // Processor settings
        if let Some(val) = lookup("BUILDLOOP_RETRY_LIMIT") {
            self.processor.retry_limit = parse_env_value(&val, "BUILDLOOP_RETRY_LIMIT")?;
        }

        if let Some(val) = lookup("BUILDLOOP_TRANSIENT_PATTERNS") {
            self.processor.transient_patterns = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Self-fix settings
        if let Some(val) = lookup("BUILDLOOP_FIX_MAX_ITERATIONS") {
            self.fix.max_iterations = parse_env_value(&val, "BUILDLOOP_FIX_MAX_ITERATIONS")?;
        }

        if let Some(val) = lookup("BUILDLOOP_FIX_ITERATION_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "BUILDLOOP_FIX_ITERATION_TIMEOUT_MS")?;
            self.fix.iteration_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(val) = lookup("BUILDLOOP_FIX_ABORT_ON_PARTIAL_APPLY") {
            self.fix.partial_apply =
                if parse_env_bool(&val, "BUILDLOOP_FIX_ABORT_ON_PARTIAL_APPLY")? {
                    PartialApplyPolicy::AbortIteration
                } else {
                    PartialApplyPolicy::ProceedToTests
                };
        }

        if let Some(val) = lookup("BUILDLOOP_FIX_MODEL") {
            self.fix.model = val;
        }

        if let Some(val) = lookup("BUILDLOOP_FIX_TEMPERATURE") {
            self.fix.temperature = parse_env_value(&val, "BUILDLOOP_FIX_TEMPERATURE")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "queue name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "queue '{}' is defined more than once",
                    queue.name
                )));
            }
            if queue.concurrency == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "concurrency for queue '{}' must be greater than 0",
                    queue.name
                )));
            }
            if queue.max_attempts == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "max_attempts for queue '{}' must be greater than 0",
                    queue.name
                )));
            }
        }

        if self.processor.retry_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_limit must be greater than 0".to_string(),
            ));
        }

        if self.processor.escalation_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "escalation_capacity must be greater than 0".to_string(),
            ));
        }

        if self.fix.max_iterations == 0 {
            return Err(ConfigError::ValidationFailed(
                "fix.max_iterations must be greater than 0".to_string(),
            ));
        }

        if self.fix.history_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "fix.history_capacity must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.fix.temperature) {
            return Err(ConfigError::ValidationFailed(
                "fix.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the shutdown grace window.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Builder method to replace the queue definitions.
    pub fn with_queues(mut self, queues: Vec<QueueDefinition>) -> Self {
        self.queues = queues;
        self
    }

    /// Builder method to set the self-fix configuration.
    pub fn with_fix(mut self, fix: FixConfig) -> Self {
        self.fix = fix;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert!(config.redis_url.is_none());
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(
            config
                .queues
                .iter()
                .map(|q| (q.name.as_str(), q.concurrency))
                .collect::<Vec<_>>(),
            vec![("generation", 1), ("build", 3), ("testing", 5)]
        );
        assert_eq!(config.queue("testing").map(|q| q.phase), Some(PhaseKind::Testing));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides_and_defaults() {
        let config = ServiceConfig::from_yaml_str(
            r#"
poll_interval_ms: 50
queues:
  - name: build
    concurrency: 2
    max_attempts: 4
    backoff: { type: fixed, delay_ms: 10 }
    schema:
      fields:
        - { name: command, type: string, required: true }
processor:
  retry_limit: 2
fix:
  max_iterations: 3
"#,
        )
        .expect("yaml should parse");

        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.queues.len(), 1);
        let build = config.queue("build").expect("build queue");
        assert_eq!(build.options().max_attempts, 4);
        assert_eq!(build.keep_completed, QueueOptions::default().keep_completed);
        assert!(build.schema.is_some());
        assert_eq!(build.phase, PhaseKind::Command);
        assert_eq!(config.processor.retry_limit, 2);
        assert!(!config.processor.transient_patterns.is_empty());
        assert_eq!(config.fix.max_iterations, 3);
        assert_eq!(config.key_prefix, "buildloop");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        config
            .apply_env_with(env(&[
                ("BUILDLOOP_REDIS_URL", "redis://127.0.0.1/"),
                ("BUILDLOOP_TRANSIENT_PATTERNS", "ECONNRESET, busy ,"),
                ("BUILDLOOP_FIX_ITERATION_TIMEOUT_MS", "1500"),
                ("BUILDLOOP_FIX_ABORT_ON_PARTIAL_APPLY", "yes"),
            ]))
            .expect("env should apply");

        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(
            config.processor.transient_patterns,
            vec!["ECONNRESET".to_string(), "busy".to_string()]
        );
        assert_eq!(config.fix.iteration_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.fix.partial_apply, PartialApplyPolicy::AbortIteration);
    }

    #[test]
    fn test_env_invalid_value() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env_with(env(&[("BUILDLOOP_FIX_MAX_ITERATIONS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("BUILDLOOP_FIX_MAX_ITERATIONS"));
    }

    #[test]
    fn test_validation_duplicate_queue() {
        let config = ServiceConfig::default().with_queues(vec![
            QueueDefinition::new("build", 1),
            QueueDefinition::new("build", 2),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let config = ServiceConfig::default().with_queues(vec![QueueDefinition::new("build", 0)]);
        assert!(config.validate().unwrap_err().to_string().contains("concurrency"));
    }

    #[test]
    fn test_validation_zero_iterations() {
        let config = ServiceConfig::default().with_fix(FixConfig::default().with_max_iterations(0));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("fix.max_iterations"));
    }

    #[test]
    fn test_validation_zero_poll_interval() {
        let config = ServiceConfig::default().with_poll_interval(Duration::ZERO);
        assert!(config.validate().unwrap_err().to_string().contains("poll_interval"));
    }
}

//! Configuration management for the batch inference core

use crate::error::{BatcherConfigError, BatcherResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// When the cached safe batch size is re-measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReprobePolicy {
    /// Probe once per model load
    Never,
    /// Probe again before the next submission after one that bisected
    #[default]
    OnOutOfMemory,
}

impl fmt::Display for ReprobePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::OnOutOfMemory => write!(f, "on-out-of-memory"),
        }
    }
}

impl FromStr for ReprobePolicy {
    type Err = BatcherConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "never" => Ok(Self::Never),
            "on-out-of-memory" | "on-oom" => Ok(Self::OnOutOfMemory),
            _ => Err(BatcherConfigError::InvalidValue {
                field: "reprobe_policy".to_string(),
                value: s.to_string(),
                reason: "expected 'never' or 'on-out-of-memory'".to_string(),
            }),
        }
    }
}

/// Batcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatcherConfig {
    /// Identifier of the model the batcher serves
    #[validate(length(min = 1, message = "Model id cannot be empty"))]
    pub model_id: String,

    /// CUDA device index; -1 selects the CPU
    #[validate(range(min = -1, message = "Device ID must be -1 (CPU) or a device index"))]
    pub device_id: i32,

    /// Fraction of free device memory one batch may use
    #[validate(range(
        exclusive_min = 0.0,
        max = 1.0,
        message = "Memory ceiling fraction must be in (0, 1]"
    ))]
    pub memory_ceiling_fraction: f64,

    /// Upper clamp for probed batch sizes
    #[validate(range(
        min = 1,
        max = 65536,
        message = "Max batch size must be between 1 and 65536"
    ))]
    pub max_batch_size: u32,

    /// Batch size used on CPU devices, where no probe runs
    #[validate(range(
        min = 1,
        max = 65536,
        message = "CPU batch size must be between 1 and 65536"
    ))]
    pub cpu_batch_size: u32,

    /// Per-range time limit in milliseconds; unset means no limit
    #[validate(range(min = 1, message = "Batch timeout must be at least 1ms"))]
    pub batch_timeout_ms: Option<u64>,

    /// Re-probe policy
    pub reprobe_policy: ReprobePolicy,

    /// Logging configuration
    #[validate(nested)]
    pub logging: LoggingConfig,

    /// Health check configuration
    #[validate(nested)]
    pub health: HealthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Log format (json, text)
    #[validate(custom(function = "validate_log_format"))]
    pub format: String,
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    /// Enable health checking
    pub enabled: bool,

    /// Device memory utilization above which the batcher reports degraded
    #[validate(range(
        min = 0.0,
        max = 1.0,
        message = "Memory utilization threshold must be between 0.0 and 1.0"
    ))]
    pub memory_utilization_threshold: f64,

    /// Consecutive failed submissions before the batcher reports unhealthy
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max consecutive failures must be between 1 and 1000"
    ))]
    pub max_consecutive_failures: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            model_id: "default".to_string(),
            device_id: 0,
            memory_ceiling_fraction: crate::DEFAULT_CEILING_FRACTION,
            max_batch_size: crate::DEFAULT_MAX_BATCH_SIZE,
            cpu_batch_size: 1,
            batch_timeout_ms: None,
            reprobe_policy: ReprobePolicy::default(),
            logging: LoggingConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl LoggingConfig {
    /// Whether logs are emitted as JSON lines
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_utilization_threshold: 0.95,
            max_consecutive_failures: 3,
        }
    }
}

/// Configuration builder for fluent configuration construction
#[derive(Debug, Default)]
pub struct BatcherConfigBuilder {
    config: BatcherConfig,
}

impl BatcherConfigBuilder {
    /// Create a new configuration builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model id
    #[must_use]
    pub fn model_id<S: Into<String>>(mut self, model_id: S) -> Self {
        self.config.model_id = model_id.into();
        self
    }

    /// Set the device ID
    #[must_use]
    pub const fn device_id(mut self, device_id: i32) -> Self {
        self.config.device_id = device_id;
        self
    }

    /// Set the memory ceiling fraction
    #[must_use]
    pub const fn memory_ceiling_fraction(mut self, fraction: f64) -> Self {
        self.config.memory_ceiling_fraction = fraction;
        self
    }

    /// Set the maximum batch size
    #[must_use]
    pub const fn max_batch_size(mut self, size: u32) -> Self {
        self.config.max_batch_size = size;
        self
    }

    /// Set the CPU batch size
    #[must_use]
    pub const fn cpu_batch_size(mut self, size: u32) -> Self {
        self.config.cpu_batch_size = size;
        self
    }

    /// Set the per-range timeout
    #[must_use]
    pub const fn batch_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.config.batch_timeout_ms = timeout_ms;
        self
    }

    /// Set the re-probe policy
    #[must_use]
    pub const fn reprobe_policy(mut self, policy: ReprobePolicy) -> Self {
        self.config.reprobe_policy = policy;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> BatcherResult<BatcherConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl BatcherConfig {
    /// Load configuration from `PIXEL_*` environment variables over the defaults
    pub fn from_env() -> BatcherResult<Self> {
        let mut config = Self::default();

        if let Ok(model_id) = env::var("PIXEL_MODEL_ID") {
            config.model_id = model_id;
        }

        if let Ok(device_id) = env::var("PIXEL_DEVICE_ID") {
            config.device_id = parse_var("device_id", device_id, "must be a valid integer")?;
        }

        if let Ok(ceiling) = env::var("PIXEL_MEMORY_CEILING") {
            config.memory_ceiling_fraction =
                parse_var("memory_ceiling_fraction", ceiling, "must be a number")?;
        }

        if let Ok(batch_size) = env::var("PIXEL_MAX_BATCH_SIZE") {
            config.max_batch_size = parse_var(
                "max_batch_size",
                batch_size,
                "must be a valid positive integer",
            )?;
        }

        if let Ok(batch_size) = env::var("PIXEL_CPU_BATCH_SIZE") {
            config.cpu_batch_size = parse_var(
                "cpu_batch_size",
                batch_size,
                "must be a valid positive integer",
            )?;
        }

        if let Ok(timeout) = env::var("PIXEL_BATCH_TIMEOUT_MS") {
            config.batch_timeout_ms = match timeout.trim() {
                "" | "0" => None,
                _ => Some(parse_var(
                    "batch_timeout_ms",
                    timeout,
                    "must be a whole number of milliseconds",
                )?),
            };
        }

        if let Ok(policy) = env::var("PIXEL_REPROBE_POLICY") {
            config.reprobe_policy = policy.parse()?;
        }

        if let Ok(log_level) = env::var("PIXEL_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> BatcherResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            BatcherConfigError::FileRead(format!("Failed to read config file: {e}"))
        })?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| BatcherConfigError::Parse(format!("Failed to parse TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> BatcherResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            BatcherConfigError::FileRead(format!("Failed to read config file: {e}"))
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| BatcherConfigError::Parse(format!("Failed to parse JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> BatcherResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BatcherConfigError::Parse(format!("Failed to serialize TOML: {e}")))?;

        fs::write(path.as_ref(), content).map_err(|e| {
            BatcherConfigError::FileRead(format!("Failed to write config file: {e}"))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> BatcherResult<()> {
        Validate::validate(self)?;

        if self.model_id.trim().is_empty() {
            return Err(BatcherConfigError::MissingField("model_id".to_string()).into());
        }

        if self.cpu_batch_size > self.max_batch_size {
            return Err(BatcherConfigError::ValidationFailed(format!(
                "CPU batch size ({}) exceeds max batch size ({})",
                self.cpu_batch_size, self.max_batch_size
            ))
            .into());
        }

        if self.memory_ceiling_fraction > 0.95 {
            tracing::warn!(
                "Memory ceiling fraction ({}) leaves almost no headroom for allocator fragmentation",
                self.memory_ceiling_fraction
            );
        }

        Ok(())
    }

    /// Whether the configured device is a GPU
    #[must_use]
    pub const fn uses_gpu(&self) -> bool {
        self.device_id >= 0
    }

    /// Per-range timeout, if any
    #[must_use]
    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: FromStr>(field: &str, value: String, reason: &str) -> BatcherResult<T> {
    value.trim().parse().map_err(|_| {
        BatcherConfigError::InvalidValue {
            field: field.to_string(),
            value,
            reason: reason.to_string(),
        }
        .into()
    })
}

// Custom validators
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("Invalid log level")),
    }
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format.to_lowercase().as_str() {
        "json" | "text" => Ok(()),
        _ => Err(ValidationError::new("Invalid log format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BatcherError;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "PIXEL_MODEL_ID",
        "PIXEL_DEVICE_ID",
        "PIXEL_MEMORY_CEILING",
        "PIXEL_MAX_BATCH_SIZE",
        "PIXEL_CPU_BATCH_SIZE",
        "PIXEL_BATCH_TIMEOUT_MS",
        "PIXEL_REPROBE_POLICY",
        "PIXEL_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = BatcherConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.uses_gpu());
        assert_eq!(config.batch_timeout(), None);
        assert_eq!(config.reprobe_policy, ReprobePolicy::OnOutOfMemory);
    }

    #[test]
    fn test_config_builder() {
        let config = BatcherConfigBuilder::new()
            .model_id("clip-vit-b32")
            .device_id(-1)
            .memory_ceiling_fraction(0.5)
            .max_batch_size(64)
            .cpu_batch_size(4)
            .batch_timeout_ms(Some(250))
            .reprobe_policy(ReprobePolicy::Never)
            .build()
            .unwrap();

        assert!(!config.uses_gpu());
        assert_eq!(config.batch_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_config_validation() {
        let zero_ceiling = BatcherConfig {
            memory_ceiling_fraction: 0.0,
            ..Default::default()
        };
        assert!(zero_ceiling.validate().is_err());

        let cpu_over_max = BatcherConfig {
            max_batch_size: 8,
            cpu_batch_size: 16,
            ..Default::default()
        };
        assert!(matches!(
            cpu_over_max.validate(),
            Err(BatcherError::Configuration(BatcherConfigError::ValidationFailed(_)))
        ));

        let blank_model = BatcherConfig {
            model_id: "   ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            blank_model.validate(),
            Err(BatcherError::Configuration(BatcherConfigError::MissingField(_)))
        ));

        let mut bad_logging = BatcherConfig::default();
        bad_logging.logging.format = "xml".to_string();
        assert!(bad_logging.validate().is_err());
    }

    #[test]
    fn test_reprobe_policy_parsing() {
        assert_eq!("never".parse::<ReprobePolicy>().unwrap(), ReprobePolicy::Never);
        assert_eq!(
            "ON_OUT_OF_MEMORY".parse::<ReprobePolicy>().unwrap(),
            ReprobePolicy::OnOutOfMemory
        );
        assert_eq!("on-oom".parse::<ReprobePolicy>().unwrap(), ReprobePolicy::OnOutOfMemory);
        assert!("sometimes".parse::<ReprobePolicy>().is_err());
        assert_eq!(ReprobePolicy::OnOutOfMemory.to_string(), "on-out-of-memory");
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var("PIXEL_MODEL_ID", "blip-large");
        env::set_var("PIXEL_DEVICE_ID", "-1");
        env::set_var("PIXEL_MEMORY_CEILING", "0.6");
        env::set_var("PIXEL_BATCH_TIMEOUT_MS", "1500");
        env::set_var("PIXEL_REPROBE_POLICY", "never");

        let config = BatcherConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.model_id, "blip-large");
        assert_eq!(config.device_id, -1);
        assert!((config.memory_ceiling_fraction - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.batch_timeout_ms, Some(1500));
        assert_eq!(config.reprobe_policy, ReprobePolicy::Never);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        clear_env();
        env::set_var("PIXEL_MAX_BATCH_SIZE", "lots");
        let result = BatcherConfig::from_env();
        clear_env();

        match result {
            Err(BatcherError::Configuration(BatcherConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "max_batch_size");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batcher.toml");

        let config = BatcherConfigBuilder::new()
            .model_id("siglip")
            .batch_timeout_ms(Some(30_000))
            .build()
            .unwrap();
        config.save_to_file(&path).unwrap();

        assert_eq!(BatcherConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_files_use_defaults() {
        let dir = TempDir::new().unwrap();

        let toml_path = dir.path().join("partial.toml");
        fs::write(&toml_path, "model_id = \"clip\"\nmax_batch_size = 32\n").unwrap();
        let config = BatcherConfig::from_file(&toml_path).unwrap();
        assert_eq!(config.max_batch_size, 32);
        assert_eq!(config.cpu_batch_size, 1);

        let json_path = dir.path().join("partial.json");
        fs::write(&json_path, r#"{"model_id": "clip", "reprobe_policy": "never"}"#).unwrap();
        let config = BatcherConfig::from_json_file(&json_path).unwrap();
        assert_eq!(config.reprobe_policy, ReprobePolicy::Never);

        assert!(matches!(
            BatcherConfig::from_file(dir.path().join("missing.toml")),
            Err(BatcherError::Configuration(BatcherConfigError::FileRead(_)))
        ));
    }
}

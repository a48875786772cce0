use crate::circuit_breaker::BreakerSettings;
use crate::config::error::{ConfigError, Result};
use crate::coordinator::CoordinatorSettings;
use crate::policy::{self, BackoffStrategy, Policy};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Policy for operation classes without an entry in `policies`
    #[serde(default)]
    pub default_policy: PolicyConfig,

    /// Per-class policies (class name → policy)
    #[serde(default = "default_policies")]
    pub policies: HashMap<String, PolicyConfig>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Retry policy as written in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_strategy")]
    pub backoff_strategy: BackoffStrategy,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Case-insensitive substrings that make an error retryable
    #[serde(default = "Policy::default_patterns")]
    pub error_patterns: Vec<String>,
}

/// Circuit breaker tuning shared by every operation class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    #[serde(default = "default_recovery_window_ms")]
    pub recovery_window_ms: u64,

    /// Probe successes needed to close a half-open breaker
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

/// Execution loop tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Fix attempts allowed per invocation
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: usize,

    /// Cached backoff delays before the cache is cleared
    #[serde(default = "default_delay_cache_capacity")]
    pub delay_cache_capacity: usize,
}

// Default value functions
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}
fn default_threshold() -> u32 {
    5
}
fn default_recovery_window_ms() -> u64 {
    30_000
}
/// Upper bound for `circuit_breaker.recovery_window_ms` (one day).
pub const MAX_RECOVERY_WINDOW_MS: u64 = 86_400_000;
fn default_half_open_successes() -> u32 {
    2
}
fn default_max_fix_attempts() -> usize {
    5
}
fn default_delay_cache_capacity() -> usize {
    crate::backoff::DEFAULT_CACHE_CAPACITY
}
fn default_policies() -> HashMap<String, PolicyConfig> {
    policy::class::ALL
        .iter()
        .filter_map(|name| {
            policy::builtin(name).map(|p| ((*name).to_string(), PolicyConfig::from(&p)))
        })
        .collect()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: default_backoff_strategy(),
            multiplier: default_multiplier(),
            jitter: default_true(),
            error_patterns: Policy::default_patterns(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            recovery_window_ms: default_recovery_window_ms(),
            half_open_successes: default_half_open_successes(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: default_max_fix_attempts(),
            delay_cache_capacity: default_delay_cache_capacity(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_policy: PolicyConfig::default(),
            policies: default_policies(),
            circuit_breaker: CircuitBreakerConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl From<&Policy> for PolicyConfig {
    fn from(policy: &Policy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: u64::try_from(policy.initial_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX),
            backoff_strategy: policy.backoff_strategy,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
            error_patterns: policy.error_patterns.clone(),
        }
    }
}

impl PolicyConfig {
    /// Build the runtime policy, rejecting invalid shapes.
    pub fn to_policy(&self, class: &str) -> Result<Policy> {
        let policy = Policy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_strategy: self.backoff_strategy,
            multiplier: self.multiplier,
            jitter: self.jitter,
            error_patterns: Vec::new(),
        }
        .with_patterns(&self.error_patterns);
        policy.validate(class)?;
        Ok(policy)
    }
}

impl CircuitBreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            threshold: self.threshold,
            recovery_window: Duration::from_millis(self.recovery_window_ms),
            half_open_successes: self.half_open_successes,
        }
    }
}

impl EngineConfig {
    /// Validate every policy and the breaker tuning.
    pub fn validate(&self) -> Result<()> {
        self.default_policy.to_policy("default")?;
        for (class, policy) in &self.policies {
            policy.to_policy(class)?;
        }

        if self.circuit_breaker.threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.recovery_window_ms > MAX_RECOVERY_WINDOW_MS {
            return Err(ConfigError::ValidationError(format!(
                "circuit_breaker.recovery_window_ms must be at most {MAX_RECOVERY_WINDOW_MS}"
            )));
        }
        if self.circuit_breaker.half_open_successes == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.half_open_successes must be at least 1".to_string(),
            ));
        }
        if self.execution.delay_cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "execution.delay_cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_fix_attempts: self.execution.max_fix_attempts,
            breaker: self.circuit_breaker.settings(),
            delay_cache_capacity: self.execution.delay_cache_capacity,
        }
    }

    /// All configured policies as runtime values, sorted by class.
    pub fn runtime_policies(&self) -> Result<Vec<(String, Policy)>> {
        let mut policies = self
            .policies
            .iter()
            .map(|(class, config)| Ok((class.clone(), config.to_policy(class)?)))
            .collect::<Result<Vec<_>>>()?;
        policies.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(policies)
    }
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (built-in class policies included)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (CKIT_RETRY_ prefix)
    pub fn load(&self) -> Result<EngineConfig> {
        let mut builder = Config::builder();

        // Layer 1: Defaults (serialize defaults to JSON and load as base)
        let defaults_json = serde_json::to_string(&EngineConfig::default())?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        // Layer 2: Config file (if provided)
        if let Some(ref path) = self.config_path {
            match std::fs::metadata(path) {
                Ok(_) => builder = builder.add_source(File::from(path.as_ref())),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ConfigError::FileNotFound(path.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Layer 3: Environment variables, double underscore for nesting
        // Example: CKIT_RETRY_CIRCUIT_BREAKER__THRESHOLD=3
        builder = builder.add_source(
            Environment::with_prefix("CKIT_RETRY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;

        tracing::debug!(
            file = ?self.config_path,
            policies = engine_config.policies.len(),
            "Loaded retry engine configuration"
        );
        Ok(engine_config)
    }

    /// Locate the default config file in standard locations:
    /// 1. Current directory: ./ckit-retry.toml
    /// 2. XDG config: ~/.config/ckit/retry.toml
    /// 3. Home directory: ~/.ckit-retry.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./ckit-retry.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("ckit").join("retry.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".ckit-retry.toml");
            if home_config.exists() {
                return Some(home_config);
            }
        }

        None
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<EngineConfig> {
        let loader = if let Some(config_path) = Self::find_config_file() {
            ConfigLoader::new().with_file(config_path)
        } else {
            ConfigLoader::new()
        };

        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

//! Engine configuration.
//!
//! Loaded from JSON with serde; every section except `credentials` has
//! defaults. [`EngineConfig::validate`] is called by the engine before any
//! pool is built.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::modules::credentials::Credential;
use crate::modules::policy::PolicyGateConfig;
use crate::modules::proxy::{EgressPath, ProxyHealthScorer};
use crate::modules::rotation::{PoolConfig, RotationStrategy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown rotation strategy `{0}`")]
    UnknownStrategy(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fractional seconds to a `Duration`; negative or non-finite values map to zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn ensure_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be a positive number")))
    }
}

fn ensure_non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be a non-negative number")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub window_secs: f64,
    pub max_uses_per_window: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_secs: 3600.0,
            max_uses_per_window: 10,
        }
    }
}

impl QuotaConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            window: seconds(self.window_secs),
            max_uses_per_window: self.max_uses_per_window,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub cache_ttl_secs: f64,
    pub wiki_pages: Vec<String>,
    pub allow_unknown: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let gate = PolicyGateConfig::default();
        Self {
            cache_ttl_secs: gate.cache_ttl.as_secs_f64(),
            wiki_pages: gate.wiki_pages,
            allow_unknown: gate.allow_unknown,
        }
    }
}

impl PolicyConfig {
    pub fn gate_config(&self) -> PolicyGateConfig {
        PolicyGateConfig {
            cache_ttl: seconds(self.cache_ttl_secs),
            wiki_pages: self.wiki_pages.clone(),
            allow_unknown: self.allow_unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub failure_margin: u64,
    pub check_timeout_secs: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_margin: 3,
            check_timeout_secs: 10.0,
        }
    }
}

impl HealthConfig {
    pub fn scorer(&self) -> ProxyHealthScorer {
        ProxyHealthScorer::new(self.failure_margin)
    }

    pub fn check_timeout(&self) -> Duration {
        seconds(self.check_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_interval_secs: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 10.0,
        }
    }
}

impl PacingConfig {
    pub fn min_interval(&self) -> Duration {
        seconds(self.min_interval_secs)
    }
}

fn default_strategy() -> String {
    RotationStrategy::default().as_str().to_string()
}

/// Complete engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_strategy")]
    pub rotation_strategy: String,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub egress_paths: Vec<EgressPath>,
}

impl EngineConfig {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            rotation_strategy: default_strategy(),
            quota: QuotaConfig::default(),
            policy: PolicyConfig::default(),
            health: HealthConfig::default(),
            pacing: PacingConfig::default(),
            credentials,
            egress_paths: Vec::new(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn strategy(&self) -> Result<RotationStrategy, ConfigError> {
        RotationStrategy::from_str(&self.rotation_strategy)
            .map_err(|_| ConfigError::UnknownStrategy(self.rotation_strategy.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.strategy()?;
        if self.credentials.is_empty() {
            return Err(ConfigError::Invalid("at least one credential is required".into()));
        }
        ensure_positive("quota.window_secs", self.quota.window_secs)?;
        if self.quota.max_uses_per_window == 0 {
            return Err(ConfigError::Invalid(
                "quota.max_uses_per_window must be positive".into(),
            ));
        }
        ensure_non_negative("policy.cache_ttl_secs", self.policy.cache_ttl_secs)?;
        ensure_positive("health.check_timeout_secs", self.health.check_timeout_secs)?;
        ensure_non_negative("pacing.min_interval_secs", self.pacing.min_interval_secs)?;
        Ok(())
    }
}

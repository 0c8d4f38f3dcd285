//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - TOML/JSON loading
//! - Serde defaults for every field
//! - Conversions into the runtime policies of each component

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenges::core::FailoverBackoff;
use crate::challenges::solvers::DEFAULT_MAX_ITERATIONS;
use crate::modules::credentials::CredentialPolicy;
use crate::modules::endpoints::RotationPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format for {0} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub rotation: RotationConfig,
    pub credentials: CredentialConfig,
    pub retry: RetryConfig,
    pub solver: SolverConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Redundant mirrors serving the same content.
    pub endpoints: Vec<String>,
    pub cooldown_enabled: bool,
    pub cooldown_secs: u64,
    pub loud_failure_threshold: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        let policy = RotationPolicy::default();
        Self {
            endpoints: Vec::new(),
            cooldown_enabled: policy.cooldown_enabled,
            cooldown_secs: policy.cooldown.as_secs(),
            loud_failure_threshold: policy.loud_failure_threshold,
        }
    }
}

impl RotationConfig {
    pub fn policy(&self) -> RotationPolicy {
        RotationPolicy {
            cooldown_enabled: self.cooldown_enabled,
            cooldown: Duration::from_secs(self.cooldown_secs),
            loud_failure_threshold: self.loud_failure_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Proxy URLs; `NO_PROXY` or an empty list means direct connections.
    pub egress: Vec<String>,
    /// Path (and query) known to trigger the challenge.
    pub probe_path: String,
    pub solved_ttl_hours: u64,
    pub captured_ttl_hours: u64,
    pub no_challenge_ttl_hours: u64,
    pub min_refresh_interval_secs: u64,
    /// redb file for persisted credentials; in-memory when absent.
    pub store_path: Option<PathBuf>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            egress: Vec::new(),
            probe_path: "/search?f=tweets&q=news".to_string(),
            solved_ttl_hours: 12,
            captured_ttl_hours: 6,
            no_challenge_ttl_hours: 1,
            min_refresh_interval_secs: 300,
            store_path: None,
        }
    }
}

impl CredentialConfig {
    pub fn policy(&self) -> CredentialPolicy {
        CredentialPolicy {
            solved_ttl: hours(self.solved_ttl_hours),
            captured_ttl: hours(self.captured_ttl_hours),
            no_challenge_ttl: hours(self.no_challenge_ttl_hours),
            min_refresh_interval: Duration::from_secs(self.min_refresh_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per request inside the failover loop.
    pub max_retries: u32,
    pub switch_on_network_error: bool,
    /// Logical attempts per fetch (challenge solves and rate-limit switches).
    pub max_logical_attempts: u32,
    pub backoff_unit_ms: u64,
    pub backoff_cap_units: f64,
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            switch_on_network_error: true,
            max_logical_attempts: 3,
            backoff_unit_ms: 1_000,
            backoff_cap_units: FailoverBackoff::DEFAULT_CAP_UNITS,
            request_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> FailoverBackoff {
        FailoverBackoff::new(Duration::from_millis(self.backoff_unit_ms))
            .with_cap(self.backoff_cap_units)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iterations: u64,
    /// Re-fetch the page for a fresh challenge before solving.
    pub force_fresh: bool,
    pub user_agent: Option<String>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            force_fresh: true,
            user_agent: None,
        }
    }
}

impl ScraperConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&contents)?,
            Some("json") => Self::from_json_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid("retry.max_retries must be at least 1".into()));
        }
        if self.retry.max_logical_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_logical_attempts must be at least 1".into(),
            ));
        }
        if self.solver.max_iterations == 0 {
            return Err(ConfigError::Invalid("solver.max_iterations must be positive".into()));
        }
        if !self.retry.backoff_cap_units.is_finite() || self.retry.backoff_cap_units < 0.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_cap_units must be a non-negative number".into(),
            ));
        }
        if !self.credentials.probe_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "credentials.probe_path must start with '/': {}",
                self.credentials.probe_path
            )));
        }
        Ok(())
    }
}

fn hours(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(3_600))
}

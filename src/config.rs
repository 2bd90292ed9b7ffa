//! Engine Configuration
//!
//! Tunables for retries, timeouts, output ceilings and locking. Values
//! are resolved in three layers: built-in defaults, an optional YAML file,
//! then `RUNKEEPER_*` environment variables.
//!
//! # Example YAML
//!
//! ```yaml
//! max_attempts: 5
//! retry_backoff_base_ms: 500
//! default_step_timeout_ms: 60000
//! gateway_bin: /usr/local/bin/gateway
//! store_dir: /var/lib/runkeeper/runs
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Hard ceiling on any single command invocation.
pub const MAX_STEP_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "RUNKEEPER_";

/// Engine-wide tunables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Total attempts per step for retryable failures (timeout, transient spawn error)
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt
    pub retry_backoff_base_ms: u64,

    /// Upper bound for the retry delay
    pub retry_backoff_max_ms: u64,

    /// Timeout used when a step does not specify one
    pub default_step_timeout_ms: u64,

    /// Ceiling applied to every step timeout
    pub max_step_timeout_ms: u64,

    /// Bytes kept per captured stream; the rest is drained and dropped
    pub output_limit_bytes: usize,

    /// Bytes of redacted output stored in each trace entry
    pub trace_excerpt_bytes: usize,

    /// Loop guard for a single resume call
    pub max_iterations: usize,

    /// Age after which a held lock is considered abandoned
    pub lock_ttl_secs: u64,

    /// Binary used for `tool` steps
    pub gateway_bin: String,

    /// Directory for the file-backed run store
    pub store_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_base_ms: 200,
            retry_backoff_max_ms: 2_000,
            default_step_timeout_ms: 120_000,
            max_step_timeout_ms: MAX_STEP_TIMEOUT.as_millis() as u64,
            output_limit_bytes: 256 * 1024,
            trace_excerpt_bytes: 16 * 1024,
            max_iterations: 200,
            lock_ttl_secs: 2 * 60 * 60,
            gateway_bin: "gateway".to_string(),
            store_dir: PathBuf::from(".runkeeper/runs"),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: EngineConfig = serde_yaml::from_str(&content).map_err(|e| {
            EngineError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Applies `RUNKEEPER_*` overrides through the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("MAX_ATTEMPTS") {
            self.max_attempts = parse_env("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF_BASE_MS") {
            self.retry_backoff_base_ms = parse_env("RETRY_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF_MAX_MS") {
            self.retry_backoff_max_ms = parse_env("RETRY_BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = get("DEFAULT_STEP_TIMEOUT_MS") {
            self.default_step_timeout_ms = parse_env("DEFAULT_STEP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("OUTPUT_LIMIT_BYTES") {
            self.output_limit_bytes = parse_env("OUTPUT_LIMIT_BYTES", &v)?;
        }
        if let Some(v) = get("LOCK_TTL_SECS") {
            self.lock_ttl_secs = parse_env("LOCK_TTL_SECS", &v)?;
        }
        if let Some(v) = get("GATEWAY_BIN") {
            if !v.trim().is_empty() {
                self.gateway_bin = v.trim().to_string();
            }
        }
        if let Some(v) = get("STORE_DIR") {
            if !v.trim().is_empty() {
                self.store_dir = PathBuf::from(v.trim());
            }
        }

        Ok(())
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be at least 1".into()));
        }
        if self.max_step_timeout_ms == 0 {
            return Err(EngineError::Config("max_step_timeout_ms must be positive".into()));
        }
        if self.max_step_timeout_ms > MAX_STEP_TIMEOUT.as_millis() as u64 {
            return Err(EngineError::Config(format!(
                "max_step_timeout_ms may not exceed {} ms",
                MAX_STEP_TIMEOUT.as_millis()
            )));
        }
        if self.output_limit_bytes == 0 || self.trace_excerpt_bytes == 0 {
            return Err(EngineError::Config("output ceilings must be positive".into()));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::Config("max_iterations must be at least 1".into()));
        }
        if self.gateway_bin.trim().is_empty() {
            return Err(EngineError::Config("gateway_bin must not be empty".into()));
        }
        debug!("Engine configuration validated: {:?}", self);
        Ok(())
    }

    /// Effective timeout for a step: requested value (or default), capped.
    pub fn step_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = match requested_ms {
            Some(ms) if ms > 0 => ms,
            _ => self.default_step_timeout_ms,
        };
        Duration::from_millis(ms.min(self.max_step_timeout_ms))
    }

    /// Delay before the given retry (1 = first retry).
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }

    pub fn max_step_timeout(&self) -> Duration {
        Duration::from_millis(self.max_step_timeout_ms)
    }

    pub fn lock_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.lock_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        EngineError::Config(format!(
            "Invalid value for {}{}: '{}'",
            ENV_PREFIX, name, value
        ))
    })
}

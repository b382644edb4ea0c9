//! Typed configuration surface
//!
//! Every recognised option is a struct field; unknown keys are a load-time
//! error rather than silently ignored. Loading follows the usual layering:
//! defaults, then `config/{RUN_MODE}`, then `config/local`, then environment
//! variables prefixed `PROMPTMUX__`.

use crate::broadcast::BackpressurePolicy;
use crate::session::CancelStrategy;
use config::{Config, ConfigError, Environment, File};
use promptmux_engine::{EngineError, MAX_LINE_BYTES};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Top-level settings for the session manager.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Global cap on concurrently executing requests
    pub max_concurrent: usize,
    pub engine: EngineSettings,
    pub pool: PoolSettings,
    pub stream: StreamSettings,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub cancel: CancelSettings,
    pub fairness: FairnessSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            engine: EngineSettings::default(),
            pool: PoolSettings::default(),
            stream: StreamSettings::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            cancel: CancelSettings::default(),
            fairness: FairnessSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSettings {
    /// Engine executable; bare names are resolved on PATH
    pub command: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub max_per_key: usize,
    pub max_idle_secs: u64,
    pub max_lifetime_secs: u64,
    pub max_reuse: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            max_per_key: 5,
            max_idle_secs: 600,
            max_lifetime_secs: 3600,
            max_reuse: 100,
        }
    }
}

impl PoolSettings {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct StreamSettings {
    /// Default ring-buffer capacity per subscriber
    pub buffer_size: usize,
    /// Hard cap on one engine stdout line, in bytes
    pub max_line_size: usize,
    /// Default policy applied to the primary subscriber
    pub backpressure_policy: BackpressurePolicy,
    /// Retained recent-history window per request
    pub history_window: usize,
    /// How long one broadcast may stay suspended on a `Block` subscriber
    pub block_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            max_line_size: MAX_LINE_BYTES,
            backpressure_policy: BackpressurePolicy::DropOldest,
            history_window: 256,
            block_timeout_ms: 5_000,
        }
    }
}

impl StreamSettings {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerSettings {
    /// Consecutive engine failures on one key before the circuit opens
    pub threshold: u32,
    pub open_duration_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_duration_secs: 30,
        }
    }
}

impl BreakerSettings {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CancelSettings {
    /// Window the engine gets to wind down after a cancel before force close
    pub grace_ms: u64,
    /// Window between SIGTERM and SIGKILL during force close
    pub force_ms: u64,
    /// Whether cancellation writes a sentinel before closing stdin
    pub strategy: CancelStrategy,
}

impl Default for CancelSettings {
    fn default() -> Self {
        Self {
            grace_ms: 2_000,
            force_ms: 1_000,
            strategy: CancelStrategy::CloseStdin,
        }
    }
}

impl CancelSettings {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn force(&self) -> Duration {
        Duration::from_millis(self.force_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct FairnessSettings {
    /// Per-user concurrent request cap. Setting it also switches global
    /// admission to round-robin turns across users with pending requests.
    /// `None` disables the fairness gate entirely.
    pub max_per_user: Option<usize>,
}

impl Settings {
    /// Load settings from config files and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("PROMPTMUX").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Reject settings no component could run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrent == 0 {
            return Err(EngineError::invalid_config("max_concurrent must be > 0"));
        }
        if self.pool.max_size == 0 {
            return Err(EngineError::invalid_config("pool.max_size must be > 0"));
        }
        if self.pool.max_per_key == 0 {
            return Err(EngineError::invalid_config("pool.max_per_key must be > 0"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(EngineError::invalid_config(
                "pool.min_size must not exceed pool.max_size",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::invalid_config("retry.max_attempts must be > 0"));
        }
        if self.breaker.threshold == 0 {
            return Err(EngineError::invalid_config("breaker.threshold must be > 0"));
        }
        if self.stream.max_line_size == 0 || self.stream.buffer_size == 0 {
            return Err(EngineError::invalid_config(
                "stream buffer and line caps must be > 0",
            ));
        }
        if let Some(0) = self.fairness.max_per_user {
            return Err(EngineError::invalid_config(
                "fairness.max_per_user must be > 0 when set",
            ));
        }
        Ok(())
    }
}

use crate::error::{DataError, Result};
use crate::registry::ConnectionInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_CONNECTOR_CACHE_SIZE: usize = 10;
pub const DEFAULT_LIMIT: u64 = 50;
pub const DEFAULT_IDLE_TIME_SECS: f64 = 300.0;
pub const DEFAULT_SWEEP_INTERVAL_SECS: f64 = 30.0;

/// Process-wide engine settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Connector instances kept before the cache is flushed
    pub connector_cache_size: usize,
    /// `limit` applied when a request does not give one
    pub default_limit: u64,
    /// Idle sessions older than this are closed
    pub idle_time_secs: f64,
    /// Any session older than this is force-closed; defaults to 5x idle time
    pub abandon_time_secs: Option<f64>,
    /// How often each pool sweeps; never longer than the idle time
    pub sweep_interval_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connector_cache_size: DEFAULT_CONNECTOR_CACHE_SIZE,
            default_limit: DEFAULT_LIMIT,
            idle_time_secs: DEFAULT_IDLE_TIME_SECS,
            abandon_time_secs: None,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `DBASSET_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connector_cache_size: std::env::var("DBASSET_CONNECTOR_CACHE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.connector_cache_size),
            default_limit: std::env::var("DBASSET_DEFAULT_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_limit),
            idle_time_secs: std::env::var("DBASSET_IDLE_TIME_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.idle_time_secs),
            abandon_time_secs: std::env::var("DBASSET_ABANDON_TIME_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(defaults.abandon_time_secs),
            sweep_interval_secs: std::env::var("DBASSET_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_interval_secs),
        }
    }

    /// Pool timing for one source, applying its `idletime` / `abandontime`
    pub fn pool_settings(&self, info: &ConnectionInfo) -> Result<PoolSettings> {
        let idle = match info.params.get("idletime") {
            Some(value) => seconds_option("idletime", value)?,
            None => self.idle_time_secs,
        };
        let abandon = match info.params.get("abandontime") {
            Some(value) => seconds_option("abandontime", value)?,
            None => self.abandon_time_secs.unwrap_or(idle * 5.0),
        };
        let sweep = self.sweep_interval_secs.min(idle);
        Ok(PoolSettings {
            idle_time: duration("idletime", idle)?,
            abandon_time: duration("abandontime", abandon)?,
            sweep_interval: duration("sweep interval", sweep.max(0.001))?,
        })
    }
}

fn seconds_option(name: &str, value: &Value) -> Result<f64> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    secs.ok_or_else(|| {
        DataError::invalid_configuration(format!("{name} must be a number of seconds"))
    })
}

fn duration(name: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(DataError::invalid_configuration(format!(
            "{name} must be a positive number of seconds"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Timing of one session pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub idle_time: Duration,
    pub abandon_time: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_time: Duration::from_secs_f64(DEFAULT_IDLE_TIME_SECS),
            abandon_time: Duration::from_secs_f64(DEFAULT_IDLE_TIME_SECS * 5.0),
            sweep_interval: Duration::from_secs_f64(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

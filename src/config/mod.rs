//! Broker-wide configuration.
//!
//! Loads a structured TOML file into strongly-typed structs using
//! `serde` + `toml`. Per-queue behavior still comes from declare-time
//! argument tables; this file only supplies broker-wide defaults.
//!
//! # Example `ambermq.toml`
//! ```toml
//! [queues]
//! default_max_count = 0        # 0 = unlimited
//! default_max_size  = 0
//!
//! [expiry]
//! sweep_interval_ms = 1_000
//!
//! [sender]
//! capacity = 1000
//! ```

use std::{fs, path::Path};

use once_cell::sync::Lazy;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueDefaults {
    /// Applied when a declare supplies no count cap. 0 = unlimited.
    pub default_max_count: u64,
    /// Applied when a declare supplies no size cap. 0 = unlimited.
    pub default_max_size: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        QueueDefaults { default_max_count: 0, default_max_size: 0 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Interval between expiry sweeps.
    pub sweep_interval_ms: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        ExpiryConfig { sweep_interval_ms: 1_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SenderConfig {
    /// Default unsettled-delivery window for new senders.
    pub capacity: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig { capacity: 1000 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub queues: QueueDefaults,
    pub expiry: ExpiryConfig,
    pub sender: SenderConfig,
}

/// Load configuration from a TOML file into `Config`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(&path)?;
    let cfg: Config = toml::from_str(&raw)?;
    Ok(cfg)
}

/// Process-wide configuration: `ambermq.toml` in the working directory
/// if present, built-in defaults otherwise.
pub static CONFIG: Lazy<Config> =
    Lazy::new(|| load_config("ambermq.toml").unwrap_or_default());

//! Runtime configuration, optionally loaded from a JSON file

use crate::broadcast::DEFAULT_BROADCAST_PERIOD_MS;
use crate::transfer::registry::{DEFAULT_TRANSFER_TTL_SECS, MAX_TRANSFER_TTL_SECS};
use crate::types::{WeightUnit, DEFAULT_BATTERY_PERCENT, MAX_BATTERY_PERCENT};
use anyhow::{ensure, Context};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_TELEMETRY_ADDR: &str = "0.0.0.0:8765";
pub const DEFAULT_TRANSFER_ADDR: &str = "0.0.0.0:8766";
pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub telemetry_addr: String,
    /// Raw 12-byte packet stream; disabled when absent.
    pub binary_addr: Option<String>,
    pub transfer_addr: String,
    pub broadcast_period_ms: u64,
    pub transfer_ttl_secs: u64,
    pub purge_interval_secs: u64,
    pub initial_battery: u8,
    pub unit: WeightUnit,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telemetry_addr: DEFAULT_TELEMETRY_ADDR.to_string(),
            binary_addr: None,
            transfer_addr: DEFAULT_TRANSFER_ADDR.to_string(),
            broadcast_period_ms: DEFAULT_BROADCAST_PERIOD_MS,
            transfer_ttl_secs: DEFAULT_TRANSFER_TTL_SECS,
            purge_interval_secs: DEFAULT_PURGE_INTERVAL_SECS,
            initial_battery: DEFAULT_BATTERY_PERCENT,
            unit: WeightUnit::Grams,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text).context("Invalid configuration JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if given, otherwise falls back to the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            info!("No config file given, using defaults");
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.broadcast_period_ms > 0, "broadcast_period_ms must be positive");
        ensure!(self.transfer_ttl_secs > 0, "transfer_ttl_secs must be positive");
        ensure!(
            self.transfer_ttl_secs <= MAX_TRANSFER_TTL_SECS,
            "transfer_ttl_secs may not exceed {}",
            MAX_TRANSFER_TTL_SECS
        );
        ensure!(self.purge_interval_secs > 0, "purge_interval_secs must be positive");
        ensure!(
            self.initial_battery <= MAX_BATTERY_PERCENT,
            "initial_battery must be 0-{}",
            MAX_BATTERY_PERCENT
        );
        ensure!(!self.telemetry_addr.is_empty(), "telemetry_addr is empty");
        ensure!(!self.transfer_addr.is_empty(), "transfer_addr is empty");
        Ok(())
    }
}

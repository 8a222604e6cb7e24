// =============================================================================
// CONFIGURATION - Load probe settings from config.toml
// =============================================================================
//
// Every section is optional. A missing file or missing keys fall back to
// the settings that reproduce the failing transfer.

use crate::backend::memory::AllocationStrategy;
use crate::scenario::Scenario;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub transfer: TransferConfig,
    pub debug: DebugConfig,
}

/// Device selection and validation settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Index into the physical device list as enumerated by the loader
    pub gpu_index: usize,
    pub validation_layers: bool,
    /// Also forward INFO and VERBOSE validation messages
    pub verbose_validation: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gpu_index: 0,
            validation_layers: true,
            verbose_validation: true,
        }
    }
}

/// What to transfer and how to back it
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub scenarios: Vec<String>,
    pub allocation: String,
    pub max_reported_mismatches: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            scenarios: vec!["wide".to_string()],
            allocation: "dedicated".to_string(),
            max_reported_mismatches: 8,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file: "transfer_probe.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get allocation strategy as an enum
    pub fn allocation_strategy(&self) -> AllocationStrategy {
        match self.transfer.allocation.to_lowercase().as_str() {
            "dedicated" => AllocationStrategy::Dedicated,
            "allocator" => AllocationStrategy::Allocator,
            _ => {
                log::warn!(
                    "Unknown allocation strategy '{}', defaulting to dedicated",
                    self.transfer.allocation
                );
                AllocationStrategy::Dedicated
            }
        }
    }

    /// Resolve configured scenario names, in order
    pub fn scenarios(&self) -> Result<Vec<Scenario>> {
        if self.transfer.scenarios.is_empty() {
            anyhow::bail!("No scenarios configured in [transfer].scenarios");
        }

        self.transfer
            .scenarios
            .iter()
            .map(|name| Scenario::by_name(name))
            .collect()
    }
}

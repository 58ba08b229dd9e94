//! Runtime configuration.
//!
//! A single JSON file (default `~/.multipath-budget/config.json`) with every
//! field defaulted, overlaid by `MULTIPATH_BUDGET_*` environment variables.

pub mod watcher;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BudgetError, Result};

pub use watcher::{ConfigWatcher, FileResourceConfig};

/// Platform-shipped fallback daily quota.
pub const DEFAULT_DAILY_QUOTA_BYTES: u64 = 2_500_000;

const ENV_TRACK_ROAMING: &str = "MULTIPATH_BUDGET_TRACK_ROAMING";
const ENV_DEFAULT_DAILY_QUOTA: &str = "MULTIPATH_BUDGET_DEFAULT_DAILY_QUOTA_BYTES";

/// Coordinator behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Keep budgeting a network while it is roaming.
    pub track_roaming: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_roaming: true,
        }
    }
}

/// Values backing the resource-default quota source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub default_daily_quota_bytes: u64,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            default_daily_quota_bytes: DEFAULT_DAILY_QUOTA_BYTES,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub tracker: TrackerConfig,
    pub resources: ResourceDefaults,
}

impl BudgetConfig {
    /// Default config file location.
    pub fn path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".multipath-budget")
            .join("config.json")
    }

    /// Parse the file at `path`. A missing file is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BudgetError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            BudgetError::config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults. Environment overrides
    /// are applied either way.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load_from_path(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Overlay `MULTIPATH_BUDGET_*` variables. Unparseable values are logged
    /// and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(ENV_TRACK_ROAMING) {
            match parse_bool(&raw) {
                Some(value) => self.tracker.track_roaming = value,
                None => warn!(var = ENV_TRACK_ROAMING, value = %raw, "Ignoring invalid boolean"),
            }
        }
        if let Ok(raw) = std::env::var(ENV_DEFAULT_DAILY_QUOTA) {
            match raw.trim().parse::<u64>() {
                Ok(bytes) if bytes > 0 => self.resources.default_daily_quota_bytes = bytes,
                _ => warn!(var = ENV_DEFAULT_DAILY_QUOTA, value = %raw, "Ignoring invalid byte count"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.resources.default_daily_quota_bytes == 0 {
            return Err(BudgetError::config(
                "resources.default_daily_quota_bytes must be positive",
            ));
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

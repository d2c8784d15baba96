use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::store::MAX_CLOSURE_LEVEL;

/// File name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "referral.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferralConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub commission: CommissionConfig,
    #[serde(default)]
    pub tree: TreeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Percentages stamped onto closure rows by level. Carried for presentation;
/// nothing in this crate computes payouts from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionConfig {
    #[serde(default = "default_commission_levels")]
    pub levels: Vec<f64>,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            levels: default_commission_levels(),
        }
    }
}

impl CommissionConfig {
    /// Percentage for a row at `level` (1-based); missing entries are zero.
    #[must_use]
    pub fn percent_for_level(&self, level: u8) -> f64 {
        usize::from(level)
            .checked_sub(1)
            .and_then(|idx| self.levels.get(idx))
            .copied()
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_max_level")]
    pub default_max_level: u8,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            default_max_level: default_max_level(),
        }
    }
}

/// Load configuration.
///
/// Lookup order: `explicit` if given (must exist), then `./referral.toml`,
/// then `<config dir>/referral/config.toml`, then built-in defaults. The
/// `REFERRAL_DB` environment variable overrides `store.path`.
///
/// # Errors
///
/// Returns an error if a config file exists but cannot be read or parsed.
pub fn load_config(explicit: Option<&Path>) -> Result<ReferralConfig> {
    let mut config = match explicit {
        Some(path) => read_config(path)?,
        None => discover_config_path()
            .map(|path| read_config(&path))
            .transpose()?
            .unwrap_or_default(),
    };

    if let Ok(db) = env::var("REFERRAL_DB") {
        if !db.trim().is_empty() {
            config.store.path = PathBuf::from(db);
        }
    }

    Ok(config)
}

fn discover_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    let user = dirs::config_dir()?.join("referral/config.toml");
    user.exists().then_some(user)
}

fn read_config(path: &Path) -> Result<ReferralConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<ReferralConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded referral config");
    Ok(config)
}

fn default_store_path() -> PathBuf {
    PathBuf::from("referral.db")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_commission_levels() -> Vec<f64> {
    vec![10.0, 5.0, 2.5]
}

const fn default_max_level() -> u8 {
    MAX_CLOSURE_LEVEL
}

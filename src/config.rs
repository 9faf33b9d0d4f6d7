//! Metamorph Configuration
//!
//! Loads and saves the core's configuration from `~/.metamorph/metamorph.json`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::types::{default_config, CoreConfig};

/// Config file name within the metamorph directory.
const CONFIG_FILENAME: &str = "metamorph.json";

/// Returns the directory holding config and database: `~/.metamorph`.
pub fn get_core_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".metamorph")
}

/// Returns the full path to the config file: `~/.metamorph/metamorph.json`.
pub fn get_config_path() -> PathBuf {
    get_core_dir().join(CONFIG_FILENAME)
}

/// Load the config from disk, merging missing fields with defaults.
///
/// Returns `None` if the config file does not exist or cannot be parsed.
pub fn load_config() -> Option<CoreConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let mut config: CoreConfig = serde_json::from_str(&contents).ok()?;

    // Merge defaults for unset fields
    let defaults = default_config();

    if config.db_path.is_empty() {
        config.db_path = defaults.db_path;
    }
    if config.sandbox_timeout_ms == 0 {
        config.sandbox_timeout_ms = defaults.sandbox_timeout_ms;
    }
    if config.max_iterations_per_goal == 0 {
        config.max_iterations_per_goal = defaults.max_iterations_per_goal;
    }
    if config.max_queued_goals == 0 {
        config.max_queued_goals = defaults.max_queued_goals;
    }
    if config.version.is_empty() {
        config.version = defaults.version;
    }

    Some(config)
}

/// Save the config to disk at `~/.metamorph/metamorph.json`.
///
/// Creates the metamorph directory with mode 0o700 if it does not exist.
/// The config file is written with mode 0o600.
pub fn save_config(config: &CoreConfig) -> Result<()> {
    let dir = get_core_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create metamorph directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let config_path = get_config_path();
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(&config_path, &json).context("Failed to write config file")?;
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

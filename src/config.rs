//! Paths and persisted settings.
//!
//! Directory priority:
//! 1. CLI `--config-dir` argument
//! 2. `SCENELINK_CONFIG_DIR` environment variable
//! 3. Local folder IF any config files exist (scenelink.json, scenelink.log)
//! 4. Platform-specific directory from dirs-next
//!
//! Platform paths:
//! - Linux: ~/.config/scenelink/{name} (data: ~/.local/share/scenelink/{name})
//! - macOS: ~/Library/Application Support/scenelink/{name}
//! - Windows: %APPDATA%\scenelink\{name}

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file name inside the config directory.
pub const SETTINGS_FILE: &str = "scenelink.json";
/// Default log file name inside the data directory.
pub const LOG_FILE: &str = "scenelink.log";

const ENV_CONFIG_DIR: &str = "SCENELINK_CONFIG_DIR";
const APP_DIR: &str = "scenelink";

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (SCENELINK_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(ENV_CONFIG_DIR).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Get path to a configuration file
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir()).join(name)
}

/// Get path to a data file (logs, exported batches)
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir()).join(name)
}

/// Ensure that configuration and data directories exist
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = resolve_dir(config, dirs_next::config_dir());
    let data_dir = resolve_dir(config, dirs_next::data_dir());

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }

    // Only create data_dir if it's different from config_dir
    if data_dir != config_dir && !data_dir.exists() {
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }

    Ok(())
}

/// Check if any config files exist in the given directory
fn has_local_config_files(dir: &Path) -> bool {
    [SETTINGS_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }

    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_config_files(&current_dir) {
            return current_dir;
        }
    }

    match platform {
        Some(dir) => dir.join(APP_DIR),
        None => PathBuf::from("."),
    }
}

/// Sync behaviour toggles, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Track armature bones alongside their objects
    pub sync_bones: bool,
    /// Enumerate procedural instances when the instance set is dirty
    pub sync_instances: bool,
    /// Export parameters of pending objects
    pub sync_properties: bool,
    /// Skip objects whose exported parameters did not change
    pub export_changed_only: bool,
    /// 0 = auto (3/4 of the logical CPUs), N = override
    pub workers: usize,
    /// Delay between passes in auto-sync mode
    pub auto_sync_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_bones: true,
            sync_instances: true,
            sync_properties: true,
            export_changed_only: true,
            workers: 0,
            auto_sync_interval_ms: 333,
        }
    }
}

impl SyncSettings {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        debug!("Settings loaded from {}", path.display());
        Ok(settings)
    }

    /// Load if the file exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No settings at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Serialize settings error")?;
        fs::write(path, json).with_context(|| format!("Failed to write settings: {}", path.display()))?;
        Ok(())
    }

    /// Effective worker thread count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            (num_cpus::get() * 3 / 4).max(1)
        }
    }
}

use crate::index::lock::BuildLock;
use crate::index::types::{IndexConfig, INDEX_FILE_NAME};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "gmindex";
const CONFIG_FILE: &str = "config.json";

/// Get the application data directory holding the config file
pub fn get_app_data_dir() -> Result<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
    } else {
        // Linux/Unix: use XDG_DATA_HOME or ~/.local/share
        dirs::data_dir()
    };

    let base = base.context("Could not determine app data directory")?;
    Ok(base.join(APP_NAME))
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_app_data_dir()?.join(CONFIG_FILE))
}

/// Load the config from `path`, or from the app data directory when `None`.
/// A missing file yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<IndexConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };

    if !config_path.exists() {
        if path.is_some() {
            anyhow::bail!("Config file {} does not exist", config_path.display());
        }
        return Ok(IndexConfig::default());
    }

    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
    let config: IndexConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;
    Ok(config)
}

/// Save the config to `path`, creating parent directories
pub fn save_config(path: &Path, config: &IndexConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, content).context("Failed to write config file")?;
    Ok(())
}

/// What [`remove_index`] cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedIndex {
    /// An index file existed and was deleted
    pub index: bool,
    /// A build lock held by a live builder was left in place
    pub live_lock: bool,
}

/// Remove the index of a module directory, plus its build lock when that
/// lock is abandoned. A lock held by a running builder is left alone.
pub fn remove_index(dir: &Path, config: &IndexConfig) -> Result<RemovedIndex> {
    let index_path = dir.join(INDEX_FILE_NAME);
    let index = match fs::remove_file(&index_path) {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to remove {}", index_path.display()));
        }
    };

    let timeout = config.lock_timeout();
    let lock_cleared =
        BuildLock::remove_abandoned(dir, timeout).context("Failed to remove build lock")?;
    let live_lock = !lock_cleared && BuildLock::is_held(dir, timeout);
    Ok(RemovedIndex { index, live_lock })
}

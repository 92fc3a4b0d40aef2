use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::AppConfig;

const CONFIG_DIR: &str = "anvil";
const CONFIG_FILE: &str = "config.toml";

pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(CONFIG_DIR))
}

pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

pub fn load() -> color_eyre::Result<AppConfig> {
    let Some(path) = config_path() else {
        debug!("No config directory found, using defaults");
        return Ok(AppConfig::default());
    };
    load_from(&path)
}

/// Reads the config at `path`; a missing file yields the defaults.
pub fn load_from(path: &Path) -> color_eyre::Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    debug!("Loaded config from {:?}", path);
    Ok(config)
}

pub fn save_to(path: &Path, config: &AppConfig) -> color_eyre::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    debug!("Saved config to {:?}", path);
    Ok(())
}

pub fn save_last_selection(scope: &str) -> color_eyre::Result<()> {
    let Some(path) = config_path() else {
        warn!("Could not determine config directory");
        return Ok(());
    };
    update_last_selection(&path, scope)
}

fn update_last_selection(path: &Path, scope: &str) -> color_eyre::Result<()> {
    let mut config = load_from(path).unwrap_or_default();
    config.last_selection = Some(scope.to_string());
    save_to(path, &config)
}

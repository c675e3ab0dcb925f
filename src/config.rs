use anyhow::{anyhow, Result};
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the page size
pub const PAGE_SIZE_ENV: &str = "CHATSYNC_PAGE_SIZE";

/// Tunables for the synchronization layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages per history page
    pub page_size: usize,
    /// How long after creation a message may still be edited
    pub edit_window_secs: i64,
    pub heartbeat_interval_secs: u64,
    /// Quiet time before a typing indicator resets itself
    pub typing_timeout_ms: u64,
    pub upload_max_attempts: u32,
    /// Backoff unit; attempt n waits n * upload_backoff_ms
    pub upload_backoff_ms: u64,
    pub signed_url_ttl_secs: u64,
    pub search_limit: usize,
    pub push_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            page_size: 50,
            edit_window_secs: 15 * 60,
            heartbeat_interval_secs: 60,
            typing_timeout_ms: 3000,
            upload_max_attempts: 3,
            upload_backoff_ms: 500,
            signed_url_ttl_secs: 3600,
            search_limit: 50,
            push_buffer: 256,
        }
    }
}

impl SyncConfig {
    pub fn edit_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.edit_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn upload_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.upload_backoff_ms * u64::from(attempt))
    }

    /// Apply environment overrides on top of file values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(PAGE_SIZE_ENV) {
            match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => self.page_size = size,
                _ => warn!("Ignoring invalid {}='{}'", PAGE_SIZE_ENV, value),
            }
        }
        self
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the per-user config file for this process
pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("chatsync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

/// Load the configuration, falling back to defaults when no file exists
pub fn load_config() -> Result<SyncConfig> {
    let config = load_config_from(&get_config_path()?)?;
    Ok(config.with_env_overrides())
}

pub fn load_config_from(path: &std::path::Path) -> Result<SyncConfig> {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(SyncConfig::default());
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: SyncConfig = serde_json::from_str(&contents)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn save_config(config: &SyncConfig) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

pub fn save_config_to(config: &SyncConfig, path: &std::path::Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Config saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_product_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.edit_window(), chrono::Duration::minutes(15));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.typing_timeout(), Duration::from_secs(3));
        assert_eq!(config.upload_max_attempts, 3);
    }

    #[test]
    fn test_backoff_scales_with_attempt() {
        let config = SyncConfig::default();
        assert_eq!(config.upload_backoff(1), Duration::from_millis(500));
        assert_eq!(config.upload_backoff(3), Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "page_size": 20 }"#).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.typing_timeout_ms, 3000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = SyncConfig::default();
        config.search_limit = 10;
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }
}

use crate::error::{CoreError, Result};
use chrono::{FixedOffset, Local, Offset};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub timeline: TimelineConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Number of activities requested per page fetch.
    pub page_size: usize,
    /// Upper bound on the number of day buckets held in memory.
    pub max_days: usize,
    /// Offset used to derive `YYYY-MM-DD` day keys. Falls back to the
    /// local offset at startup when unset.
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Cadence at which buffered stream fragments become visible.
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/.recall".to_string(),
        }
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            page_size: 15,
            max_days: 100,
            utc_offset_minutes: None,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 16,
        }
    }
}

impl TimelineConfig {
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        match self.utc_offset_minutes {
            Some(minutes) => FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
                CoreError::Config(format!("utc_offset_minutes out of range: {minutes}"))
            }),
            None => Ok(Local::now().offset().fix()),
        }
    }
}

impl ChatConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl AppConfig {
    /// Load config from `~/.recall/config.toml`, creating defaults if missing.
    pub fn load() -> Result<Self> {
        let base_dir = Self::default_base_dir()?;
        let config_path = base_dir.join("config.toml");

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = AppConfig::default();
            config.ensure_dirs()?;
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
            fs::write(&config_path, toml_str)?;
            Ok(config)
        }
    }

    /// Load config from a specific path (for testing or custom setups).
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read config: {e}")))?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))?;
        if config.timeline.page_size == 0 {
            return Err(CoreError::Config("timeline.page_size must be positive".to_string()));
        }
        if config.timeline.max_days == 0 {
            return Err(CoreError::Config("timeline.max_days must be positive".to_string()));
        }
        Ok(config)
    }

    /// Returns the resolved base directory (expands `~`).
    pub fn base_dir(&self) -> Result<PathBuf> {
        resolve_tilde(&self.storage.base_dir)
    }

    /// Returns the default base directory (`~/.recall`).
    pub fn default_base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(".recall"))
    }

    /// Returns the path to the SQLite database.
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("recall.db"))
    }

    /// Ensure the base directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        let base = self.base_dir()?;
        fs::create_dir_all(&base)?;
        Ok(())
    }
}

/// Expand `~` to the user's home directory.
fn resolve_tilde(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(rest))
    } else if path == "~" {
        dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Initialize tracing/logging with env filter.
///
/// Respects `RUST_LOG` env var. Defaults to `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.timeline.page_size, 15);
        assert_eq!(config.timeline.max_days, 100);
        assert!(config.timeline.utc_offset_minutes.is_none());
        assert_eq!(config.chat.flush_interval(), Duration::from_millis(16));
        assert_eq!(config.storage.base_dir, "~/.recall");
    }

    #[test]
    fn test_load_from_toml() {
        let toml_content = r#"
[storage]
base_dir = "/tmp/test-recall"

[timeline]
page_size = 30
utc_offset_minutes = 540
"#;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(toml_content.as_bytes()).unwrap();

        let config = AppConfig::load_from(f.path()).unwrap();
        assert_eq!(config.timeline.page_size, 30);
        assert_eq!(
            config.timeline.utc_offset().unwrap(),
            FixedOffset::east_opt(9 * 3600).unwrap()
        );
        assert_eq!(config.db_path().unwrap(), PathBuf::from("/tmp/test-recall/recall.db"));
        // defaults for fields not specified
        assert_eq!(config.timeline.max_days, 100);
        assert_eq!(config.chat.flush_interval_ms, 16);
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"[timeline]\npage_size = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(f.path()),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_out_of_range_offset() {
        let config = TimelineConfig {
            utc_offset_minutes: Some(100_000),
            ..TimelineConfig::default()
        };
        assert!(config.utc_offset().is_err());
    }
}

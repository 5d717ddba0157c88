//! Global CLI configuration management
//!
//! Stores the default server URL and key in ~/.exposer/config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Global CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposerConfig {
    /// Default server URL, e.g. `https://exposer.example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Default shared key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the config file path
    pub fn get_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".exposer").join("config.json"))
    }

    /// Load the configuration from disk
    pub fn load() -> Result<ExposerConfig> {
        Self::load_from(&Self::get_config_path()?)
    }

    /// Save the configuration to disk
    pub fn save(config: &ExposerConfig) -> Result<()> {
        Self::save_to(&Self::get_config_path()?, config)
    }

    pub fn load_from(path: &Path) -> Result<ExposerConfig> {
        // Missing file means defaults
        if !path.exists() {
            return Ok(ExposerConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&json).context(format!("Failed to parse config file: {:?}", path))
    }

    pub fn save_to(path: &Path, config: &ExposerConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    pub fn set_server(server: String) -> Result<()> {
        let mut config = Self::load()?;
        config.server = Some(server);
        Self::save(&config)
    }

    pub fn set_key(key: String) -> Result<()> {
        let mut config = Self::load()?;
        config.key = Some(key);
        Self::save(&config)
    }

    /// Remove every stored setting
    pub fn clear() -> Result<()> {
        Self::save(&ExposerConfig::default())
    }
}

/// Pick the explicit value if given, else the stored default
pub fn resolve(explicit: Option<String>, stored: Option<String>, what: &str) -> Result<String> {
    explicit.or(stored).with_context(|| {
        format!(
            "No {what} configured. Pass --{what}, set EXPOSER_{}, or run 'exposer config set-{what}'",
            what.to_uppercase()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExposerConfig::default();
        assert!(config.server.is_none());
        assert!(config.key.is_none());
        assert_eq!(serde_json::to_string(&config).unwrap(), "{}");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        assert_eq!(ConfigManager::load_from(&path).unwrap(), ExposerConfig::default());

        let config = ExposerConfig {
            server: Some("http://localhost:9000".to_string()),
            key: Some("secret".to_string()),
        };
        ConfigManager::save_to(&path, &config).unwrap();

        assert_eq!(ConfigManager::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();

        assert!(ConfigManager::load_from(&path).is_err());
    }

    #[test]
    fn test_resolve_prefers_explicit() {
        assert_eq!(
            resolve(Some("flag".into()), Some("file".into()), "key").unwrap(),
            "flag"
        );
        assert_eq!(resolve(None, Some("file".into()), "key").unwrap(), "file");

        let err = resolve(None, None, "server").unwrap_err().to_string();
        assert!(err.contains("EXPOSER_SERVER"));
    }
}

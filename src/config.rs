use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::utils::paths::{get_config_path, get_database_path, get_packages_dir};

pub const DEFAULT_PORT: u16 = 48380;

/// Admin API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Plugin lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Restore ENABLED plugins on startup
    #[serde(default = "default_auto_load")]
    pub auto_load: bool,

    /// Upper bound on a single invocation, whatever the manifest asks for
    #[serde(default = "default_max_invoke_timeout_secs")]
    pub max_invoke_timeout_secs: u64,

    /// Capacity of each capability event subscriber queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Where staged packages live (defaults to ~/.aihub/packages)
    #[serde(default)]
    pub packages_dir: Option<PathBuf>,

    /// Largest total size a package may unpack to
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: u64,

    /// How often the server re-reads the store for changes made by other
    /// processes (0 disables)
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_auto_load() -> bool {
    true
}

fn default_max_invoke_timeout_secs() -> u64 {
    300
}

fn default_event_buffer() -> usize {
    64
}

fn default_max_package_bytes() -> u64 {
    crate::plugin::package::DEFAULT_MAX_UNPACKED_BYTES
}

fn default_reconcile_interval_secs() -> u64 {
    5
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            auto_load: default_auto_load(),
            max_invoke_timeout_secs: default_max_invoke_timeout_secs(),
            event_buffer: default_event_buffer(),
            packages_dir: None,
            max_package_bytes: default_max_package_bytes(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Plugin registry database (defaults to ~/.aihub/aihub.db)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = get_config_path()?;

        if !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config at {:?}", config_path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config at {:?}", config_path))?;

        Ok(config)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => get_database_path(),
        }
    }

    pub fn packages_dir(&self) -> Result<PathBuf> {
        match &self.plugins.packages_dir {
            Some(path) => Ok(path.clone()),
            None => get_packages_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(config.plugins.auto_load);
        assert_eq!(config.plugins.event_buffer, 64);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("auto_load"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            database_path = "/var/lib/aihub/aihub.db"

            [plugins]
            auto_load = false
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(!config.plugins.auto_load);
        assert_eq!(config.plugins.max_invoke_timeout_secs, 300);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/var/lib/aihub/aihub.db")
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.plugins.event_buffer, 64);
        assert_eq!(config.plugins.reconcile_interval_secs, 5);
        assert_eq!(config.plugins.max_package_bytes, 512 * 1024 * 1024);
        assert!(config.packages_dir().unwrap().ends_with("packages"));
    }
}

//! Configuration management
//!
//! This module handles loading, validation, and management of the Storyline
//! configuration. Configuration is stored in TOML format at
//! ~/.storyline/config.toml and created with defaults on first run.
//!
//! # Configuration Sections
//!
//! - **core**: log level, data directory
//! - **server**: webhook bind address and verify token
//! - **messenger**: Send API endpoint and page access token
//! - **catalog**: story catalog file (built-in booking catalog when unset)
//! - **nlu**: NLU payload key to data type map
//! - **engine**: collaborator call timeout
//!
//! The page access token may instead come from the
//! `STORYLINE_PAGE_ACCESS_TOKEN` environment variable, which wins over the
//! file.
//!
//! # Examples
//!
//! ```no_run
//! use storyline_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Listening on {}", config.server.bind_addr);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::DataType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `messenger.page_access_token`
pub const PAGE_ACCESS_TOKEN_ENV: &str = "STORYLINE_PAGE_ACCESS_TOKEN";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Webhook server
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound messaging
    #[serde(default)]
    pub messenger: MessengerConfig,

    /// Story catalog source
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// NLU payload parsing
    #[serde(default)]
    pub nlu: NluConfig,

    /// Turn processing
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Token the platform echoes during the subscription handshake
    #[serde(default = "default_verify_token")]
    pub verify_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Empty means replies are only logged
    #[serde(default)]
    pub page_access_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// TOML catalog file (supports ~ expansion)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NluConfig {
    /// Payload key to data type
    #[serde(default = "default_data_types")]
    pub data_types: BTreeMap<String, DataType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on each repository call and step side-effect
    #[serde(default = "default_collaborator_timeout_secs")]
    pub collaborator_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.storyline/data")
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_verify_token() -> String {
    "storyline_verify_token".to_string()
}

fn default_api_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_api_version() -> String {
    "v18.0".to_string()
}

fn default_data_types() -> BTreeMap<String, DataType> {
    BTreeMap::from([
        ("intent".to_string(), DataType::Intent),
        ("nb_persons".to_string(), DataType::Int),
        ("booking_date".to_string(), DataType::DateTime),
    ])
}

fn default_collaborator_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            verify_token: default_verify_token(),
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_version: default_api_version(),
            page_access_token: String::new(),
        }
    }
}

impl Default for NluConfig {
    fn default() -> Self {
        Self {
            data_types: default_data_types(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

impl NluConfig {
    pub fn data_type_map(&self) -> HashMap<String, DataType> {
        self.data_types
            .iter()
            .map(|(key, data_type)| (key.clone(), *data_type))
            .collect()
    }
}

impl EngineConfig {
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }
}

impl Config {
    /// Load configuration from the default location (~/.storyline/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save it to `path`
    pub fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Written before processing so the file keeps the portable ~ paths
        let mut config = Self::default_config();
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.storyline/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".storyline").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            server: ServerConfig::default(),
            messenger: MessengerConfig::default(),
            catalog: CatalogConfig::default(),
            nlu: NluConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// SQLite database file inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("storyline.db")
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level, bind address, verify token and timeout
    /// - Expands ~ in paths
    /// - Creates the data directory if it doesn't exist
    /// - Applies the page access token environment override
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.server.bind_addr.parse::<SocketAddr>().map_err(|e| {
            EngineError::Config(format!(
                "Invalid bind address '{}': {}",
                self.server.bind_addr, e
            ))
        })?;

        if self.server.verify_token.trim().is_empty() {
            return Err(EngineError::Config(
                "server.verify_token cannot be empty".to_string(),
            ));
        }

        if !(1..=300).contains(&self.engine.collaborator_timeout_secs) {
            return Err(EngineError::Config(
                "collaborator_timeout_secs must be between 1 and 300".to_string(),
            ));
        }

        if !self.messenger.api_base_url.starts_with("http://")
            && !self.messenger.api_base_url.starts_with("https://")
        {
            return Err(EngineError::Config(format!(
                "Invalid messenger api_base_url '{}'",
                self.messenger.api_base_url
            )));
        }

        if let Ok(token) = std::env::var(PAGE_ACCESS_TOKEN_ENV) {
            if !token.is_empty() {
                self.messenger.page_access_token = token;
            }
        }

        if let Some(path) = &self.catalog.path {
            self.catalog.path = Some(expand_path(path)?);
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.engine.collaborator_timeout_secs, 10);
        assert!(config.catalog.path.is_none());
        assert_eq!(config.nlu.data_types.get("nb_persons"), Some(&DataType::Int));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.nlu.data_types, deserialized.nlu.data_types);
        assert_eq!(config.server.verify_token, deserialized.server.verify_token);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            format!("[core]\ndata_dir = {:?}\n", data_dir.to_str().unwrap()),
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.messenger.api_version, "v18.0");
        assert!(data_dir.is_dir());
        assert_eq!(config.database_path(), data_dir.join("storyline.db"));
    }

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let data_dir = dir.path().join("data");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            format!("[core]\ndata_dir = {:?}\n\n{}", data_dir.to_str().unwrap(), body),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_invalid_values_rejected() {
        for body in [
            "[server]\nbind_addr = \"not an address\"\n",
            "[server]\nverify_token = \"  \"\n",
            "[engine]\ncollaborator_timeout_secs = 0\n",
            "[messenger]\napi_base_url = \"graph.facebook.com\"\n",
            "[nlu.data_types]\nintent = \"colour\"\n",
        ] {
            let temp_dir = TempDir::new().unwrap();
            let path = write_config(&temp_dir, body);

            assert!(
                matches!(Config::load_from_path(&path), Err(EngineError::Config(_))),
                "accepted: {}",
                body
            );
        }
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[core]\nlog_level = \"loud\"\ndata_dir = \"/tmp\"\n").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_catalog_path_and_custom_types() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            "[catalog]\npath = \"/srv/stories.toml\"\n\n[nlu.data_types]\nintent = \"intent\"\nguests = \"int\"\n",
        );

        let config = Config::load_from_path(&path).unwrap();

        assert_eq!(config.catalog.path, Some(PathBuf::from("/srv/stories.toml")));
        let types = config.nlu.data_type_map();
        assert_eq!(types.len(), 2);
        assert_eq!(types.get("guests"), Some(&DataType::Int));
    }

    #[test]
    fn test_create_default_writes_portable_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config::create_default(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("~/.storyline/data"));
        assert!(contents.contains("[server]"));
        assert!(!config.core.data_dir.starts_with("~"));
    }
}

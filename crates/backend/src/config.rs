//! The JSON configuration file shared with the host GUI.
//!
//! The sidecar validates the two fields it depends on and preserves
//! everything else verbatim; the host owns the file's wider schema.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub ntp_server: String,
    pub default_ttl_hours: f64,
    /// Fields the sidecar does not interpret, carried across load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ntp_server: "pool.ntp.org".to_string(),
            default_ttl_hours: 24.0,
            extra: Map::new(),
        }
    }
}

impl AppConfig {
    /// Loads and validates the config; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates and writes the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ntp_server.is_empty() {
            return Err(ConfigError::Invalid("ntp_server must be a non-empty string"));
        }
        if !(self.default_ttl_hours > 0.0) {
            return Err(ConfigError::Invalid(
                "default_ttl_hours must be a positive number",
            ));
        }
        Ok(())
    }
}

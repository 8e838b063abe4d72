//! Optional TOML config file (`keyble.toml` by default), supplying
//! defaults that CLI flags always override.

use std::path::Path;

use keyble_proto::error::ConfigError;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub device: Option<String>,
    #[serde(rename = "user-id")]
    pub user_id: Option<u8>,
    #[serde(rename = "user-key")]
    pub user_key: Option<String>,
    #[serde(rename = "mqtt-broker")]
    pub mqtt_broker: Option<String>,
    pub timeout: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::BadConfigFile(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::BadConfigFile(e.to_string()))
    }

    /// Loads `path` if given, otherwise the default `keyble.toml` if it
    /// exists in the current directory; returns an empty `Config` if
    /// neither is present.
    pub fn load_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new("keyble.toml");
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

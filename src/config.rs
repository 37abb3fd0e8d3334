//! Configuration for the YawIO demo daemon
//!
//! Loads configuration from a TOML file with the minimal parameters needed
//! to identify the game and reach the local network.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub game: GameConfig,
    pub network: NetworkConfig,
    pub preferences: PreferencesConfig,
    pub logging: LoggingConfig,
}

/// Game identity configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GameConfig {
    /// Game name sent with the check-in command
    pub name: String,
}

/// Network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Local UDP port for telemetry and discovery responses
    ///
    /// Also the port discovery broadcasts target: the platform listens where
    /// it was called. Must be above 1024 for discovery to run.
    pub udp_port: u16,
}

/// Preference persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreferencesConfig {
    /// Path of the TOML preference file (remembered device, multipliers)
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Default configuration, suitable for testing and development
    pub fn defaults() -> Self {
        Self {
            game: GameConfig {
                name: "YawIO".to_string(),
            },
            network: NetworkConfig { udp_port: 50010 },
            preferences: PreferencesConfig {
                path: "yawio-prefs.toml".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

//! Configuration for Courier services.
//!
//! All settings come from the environment with sensible defaults, so the
//! server runs with zero configuration in development and picks up the
//! platform-provided `PORT` when deployed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default listening port when `PORT` is not set.
pub const DEFAULT_PORT: u16 = 4000;

/// Default SQLite database file, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "courier.db";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default 0.0.0.0)
    pub host: String,
    /// Listening port (default 4000, overridden by `PORT`)
    pub port: u16,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (overridden by `COURIER_DB`)
    pub path: PathBuf,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level: trace, debug, info, warn, error
    pub log_level: String,
    /// Output format: "pretty" or "json"
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
            },
            database: DatabaseConfig {
                path: PathBuf::from(DEFAULT_DB_PATH),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: "pretty".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// A malformed `PORT` value falls back to the default rather than
    /// aborting startup.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                config.server.host = host;
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.server.port = p,
                Err(_) => {
                    tracing::warn!(port = %port, "Invalid PORT value, using default");
                }
            }
        }

        if let Ok(path) = std::env::var("COURIER_DB") {
            if !path.is_empty() {
                config.database.path = PathBuf::from(path);
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                config.observability.log_level = level;
            }
        }

        if let Ok(format) = std::env::var("LOG_FORMAT") {
            if !format.is_empty() {
                config.observability.log_format = format;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.database.path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.observability.log_level, "info");
        assert_eq!(config.observability.log_format, "pretty");
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("4000"));
    }
}

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::WaahError;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub allowed_origins: Vec<String>,
    pub default_wait_timeout_secs: u64,
    pub min_wait_timeout_secs: u64,
    pub max_wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub log_retention_days: i64,
    /// Safety-net threshold (spec §4.5.3): an agent's `waitingSince` older
    /// than this is cleared even without a matching cancellation signal.
    pub waiting_drop_threshold_secs: i64,
}

impl Config {
    /// Loads configuration from the environment (via `dotenvy`), falling
    /// back to the defaults documented in the operation table.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {e}"),
        }

        let api_key = match env::var("WAAAH_API_KEY").ok() {
            Some(key) if !key.trim().is_empty() => {
                if key.len() < 32 {
                    return Err(WaahError::InvalidIdentity(
                        "WAAAH_API_KEY must be at least 32 characters".to_string(),
                    ));
                }
                key
            }
            _ => {
                tracing::warn!("WAAAH_API_KEY not set, generating and persisting one");
                crate::security::ensure_api_key_exists(None)?
            }
        };

        let allowed_origins = env::var("WAAAH_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let server = ServerConfig {
            host: env::var("WAAAH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("WAAAH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            api_key,
            allowed_origins,
            default_wait_timeout_secs: 290,
            min_wait_timeout_secs: 1,
            max_wait_timeout_secs: 3600,
        };

        let database = DatabaseConfig {
            path: env::var("WAAAH_DATABASE_PATH").unwrap_or_else(|_| "waaah.db".to_string()),
        };

        let scheduler = SchedulerConfig {
            tick_interval_secs: env::var("WAAAH_SCHEDULER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            log_retention_days: env::var("WAAAH_LOG_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            waiting_drop_threshold_secs: env::var("WAAAH_WAITING_DROP_THRESHOLD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
        };

        let seed_path = env::var("WAAAH_SEED_PATH").ok();

        Ok(Config {
            server,
            database,
            scheduler,
            seed_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn load_rejects_short_api_key() {
        env::set_var("WAAAH_API_KEY", "too-short");
        let result = Config::load();
        env::remove_var("WAAAH_API_KEY");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn load_applies_defaults() {
        env::remove_var("WAAAH_PORT");
        env::set_var("WAAAH_API_KEY", "a".repeat(32));
        let config = Config::load().expect("config should load with a valid key");
        env::remove_var("WAAAH_API_KEY");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.default_wait_timeout_secs, 290);
        assert_eq!(config.scheduler.tick_interval_secs, 1);
    }
}

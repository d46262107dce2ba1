//! Configuration management for ChunkVault
//!
//! Values come from the process environment (optionally seeded from a
//! `.env` file by the binaries). Anything unset falls back to the defaults.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::fault::FaultConfig;
use crate::upload::{DEFAULT_CHUNK_SIZE, SESSION_EXPIRY_HOURS, SWEEP_INTERVAL_SECS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub chaos: FaultConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the vault; holds the `incomplete/` and `ready/` areas
    pub vault_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub chunk_size: u64,
    pub expiry_hours: i64,
    pub sweep_interval_secs: u64,
}

impl UploadConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiry_hours)
    }
}

/// Client-side settings used by `chunkvault-push`
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,
    pub state_dir: PathBuf,
    pub concurrency: usize,
    pub chunk_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5001,
            },
            storage: StorageConfig {
                vault_dir: PathBuf::from("./vault"),
            },
            database: DatabaseConfig {
                url: "sqlite:./chunkvault.db".to_string(),
            },
            upload: UploadConfig {
                chunk_size: DEFAULT_CHUNK_SIZE,
                expiry_hours: SESSION_EXPIRY_HOURS,
                sweep_interval_secs: SWEEP_INTERVAL_SECS,
            },
            chaos: FaultConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                vault_dir: env::var("VAULT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.vault_dir),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                chunk_size: parse_var("CHUNK_SIZE_BYTES", defaults.upload.chunk_size)?,
                expiry_hours: parse_var("SESSION_EXPIRY_HOURS", defaults.upload.expiry_hours)?,
                sweep_interval_secs: parse_var(
                    "SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval_secs,
                )?,
            },
            chaos: FaultConfig {
                enabled: parse_var("ENABLE_CHAOS", defaults.chaos.enabled)?,
                failure_rate: parse_var("CHAOS_FAILURE_RATE", defaults.chaos.failure_rate)?,
                max_latency_ms: parse_var("CHAOS_MAX_LATENCY_MS", defaults.chaos.max_latency_ms)?,
                seed: match env::var("CHAOS_SEED") {
                    Ok(raw) => Some(parse_value("CHAOS_SEED", &raw)?),
                    Err(_) => None,
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upload = &self.upload;
        ensure("CHUNK_SIZE_BYTES", upload.chunk_size, upload.chunk_size > 0)?;
        ensure("SESSION_EXPIRY_HOURS", upload.expiry_hours, upload.expiry_hours > 0)?;
        ensure(
            "SWEEP_INTERVAL_SECS",
            upload.sweep_interval_secs,
            upload.sweep_interval_secs > 0,
        )?;

        let rate = self.chaos.failure_rate;
        ensure(
            "CHAOS_FAILURE_RATE",
            rate,
            rate.is_finite() && (0.0..=1.0).contains(&rate),
        )?;
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_url: "http://localhost:5001".to_string(),
            state_dir: PathBuf::from("./.chunkvault"),
            concurrency: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ClientConfig::default();

        let config = ClientConfig {
            server_url: env::var("VAULT_SERVER_URL").unwrap_or(defaults.server_url),
            state_dir: env::var("VAULT_CLIENT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            concurrency: parse_var("UPLOAD_CONCURRENCY", defaults.concurrency)?,
            chunk_size: parse_var("CHUNK_SIZE_BYTES", defaults.chunk_size)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure("UPLOAD_CONCURRENCY", self.concurrency, self.concurrency > 0)?;
        ensure("CHUNK_SIZE_BYTES", self.chunk_size, self.chunk_size > 0)
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn ensure<T: ToString>(key: &'static str, value: T, ok: bool) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError {
            key,
            value: value.to_string(),
        })
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError {
        key,
        value: raw.to_string(),
    })
}

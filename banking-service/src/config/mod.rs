//! Configuration module for banking-service.

use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub service_name: String,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-request timeout for bank API calls.
    pub request_timeout_secs: u64,
    /// Total elapsed budget for transient-error retries within one sync.
    pub retry_max_elapsed_secs: u64,
    /// Snapshot age beyond which a balances read attempts a fresh sync.
    pub balance_snapshot_ttl_secs: i64,
    /// Interval of the background sweep that expires overdue consents.
    pub expiry_sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("BANKING_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("BANKING_SERVICE_PORT")
            .unwrap_or_else(|_| "3007".to_string())
            .parse()?;

        let db_url = env::var("BANKING_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("BANKING_DATABASE_URL must be set"))?;

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections: env_parse("BANKING_DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_parse("BANKING_DATABASE_MIN_CONNECTIONS", 2),
            },
            sync: SyncConfig {
                request_timeout_secs: env_parse("BANKING_REQUEST_TIMEOUT_SECS", 30),
                retry_max_elapsed_secs: env_parse("BANKING_RETRY_MAX_ELAPSED_SECS", 60),
                balance_snapshot_ttl_secs: env_parse("BANKING_BALANCE_SNAPSHOT_TTL_SECS", 900),
                expiry_sweep_interval_secs: env_parse("BANKING_EXPIRY_SWEEP_INTERVAL_SECS", 3600),
            },
            service_name: "banking-service".to_string(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

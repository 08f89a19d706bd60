//! Configuration loader for the `lidarflow` backend service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Read an optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

/// Where measurements and owners are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    /// Process memory; everything is lost on restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => bail!("Invalid STORAGE_BACKEND: `{}` (expected postgres or memory)", other),
        }
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    pub storage: StorageBackend,

    /// PostgreSQL connection string; empty with the memory backend.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Port for the HTTP API and WebSocket channels.
    pub http_port: u16,

    /// Port for raw device connections.
    pub device_port: u16,

    /// HS256 secret used to validate session tokens.
    pub jwt_secret: String,

    /// Cookie carrying the session token.
    pub cookie_name: String,

    /// Idle deadline for device connections and open measurements.
    pub session_idle: Duration,

    /// How often the stale-measurement sweep runs.
    pub sweep_interval: Duration,

    /// Updates buffered per observer before it starts skipping.
    pub fanout_capacity: usize,

    /// `login[:display name]` owners created at startup.
    pub seed_owners: Vec<String>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `JWT_SECRET` – session token secret
/// - `DATABASE_URL` – PostgreSQL connection string (postgres backend only)
///
/// Optional:
/// - `STORAGE_BACKEND` – `postgres` or `memory` (default: postgres)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `HTTP_PORT` – HTTP/WebSocket port (default: 8080)
/// - `DEVICE_PORT` – raw device port (default: 9000)
/// - `COOKIE_NAME` – session cookie name (default: auth_token)
/// - `SESSION_IDLE_SECS` – idle deadline (default: 300)
/// - `SWEEP_INTERVAL_SECS` – stale sweep period (default: 60)
/// - `FANOUT_CAPACITY` – observer buffer (default: 256)
/// - `SEED_OWNERS` – comma-separated `login[:display name]` list
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let storage: StorageBackend = env_or!("STORAGE_BACKEND", "postgres").parse()?;
    let db_url = match storage {
        StorageBackend::Postgres => require_env!("DATABASE_URL"),
        StorageBackend::Memory => env_or!("DATABASE_URL", ""),
    };
    let jwt_secret = require_env!("JWT_SECRET");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let http_port = port(parse_env_u32!("HTTP_PORT", 8080), "HTTP_PORT")?;
    let device_port = port(parse_env_u32!("DEVICE_PORT", 9000), "DEVICE_PORT")?;
    let cookie_name = env_or!("COOKIE_NAME", "auth_token");
    let session_idle = Duration::from_secs(parse_env_u32!("SESSION_IDLE_SECS", 300).into());
    let sweep_interval = Duration::from_secs(parse_env_u32!("SWEEP_INTERVAL_SECS", 60).into());
    let fanout_capacity = parse_env_u32!("FANOUT_CAPACITY", 256) as usize;
    let seed_owners = parse_list(&env_or!("SEED_OWNERS", ""));

    if session_idle.is_zero() {
        bail!("SESSION_IDLE_SECS must be greater than zero");
    }

    Ok(Config {
        storage,
        db_url,
        db_pool_max,
        http_port,
        device_port,
        jwt_secret,
        cookie_name,
        session_idle,
        sweep_interval,
        fanout_capacity,
        seed_owners,
    })
}

fn port(value: u32, var_name: &str) -> Result<u16> {
    u16::try_from(value).map_err(|_| anyhow!("Invalid {}: {} is not a port", var_name, value))
}

fn parse_list(raw: &str) -> Vec<String> {
    // ---
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  STORAGE_BACKEND     : {:?}", self.storage);
        tracing::info!("  DATABASE_URL        : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX         : {}", self.db_pool_max);
        tracing::info!("  HTTP_PORT           : {}", self.http_port);
        tracing::info!("  DEVICE_PORT         : {}", self.device_port);
        tracing::info!("  JWT_SECRET          : ****");
        tracing::info!("  COOKIE_NAME         : {}", self.cookie_name);
        tracing::info!("  SESSION_IDLE_SECS   : {}", self.session_idle.as_secs());
        tracing::info!("  SWEEP_INTERVAL_SECS : {}", self.sweep_interval.as_secs());
        tracing::info!("  FANOUT_CAPACITY     : {}", self.fanout_capacity);
        tracing::info!("  SEED_OWNERS         : {}", self.seed_owners.len());
    }
}

/// Mask the password in a database URL for logging.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
        }
    }
    db_url.to_string()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_mask_db_url() {
        // ---
        assert_eq!(
            mask_db_url("postgres://lidar:secret@db:5432/lidar"),
            "postgres://lidar:****@db:5432/lidar"
        );
        assert_eq!(mask_db_url("postgres://db/lidar"), "postgres://db/lidar");
    }

    #[test]
    fn test_storage_backend_names() {
        // ---
        assert_eq!("memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert_eq!(" PostgreSQL ".parse::<StorageBackend>().unwrap(), StorageBackend::Postgres);
        assert!("sqlite".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_parse_list_skips_blanks() {
        // ---
        assert_eq!(parse_list("alice, bob:Bob B ,,"), vec!["alice", "bob:Bob B"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_port_range() {
        // ---
        assert_eq!(port(8080, "HTTP_PORT").unwrap(), 8080);
        assert!(port(70_000, "HTTP_PORT").is_err());
    }
}

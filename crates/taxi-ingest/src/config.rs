//! Configuration management
//!
//! Values come from the environment (after `.env` is loaded by the binary)
//! with the constants below as defaults. Command-line flags override both.

use crate::storage::StorageConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Ingestion Defaults
// ============================================================================

/// Maximum rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Local directory for staged and written files.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Extra attempts made when staging a dataset fails.
pub const DEFAULT_STAGE_RETRIES: u32 = 2;

/// Lifetime of a staged file in the cache (1 day).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;

/// Default PostgreSQL port.
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Default table for trip loads.
pub const DEFAULT_TABLE_NAME: &str = "yellow_taxi_data";

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbConfig {
    /// Full connection URL; takes precedence over the individual parts
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: DEFAULT_PG_PORT,
            username: "root".to_string(),
            password: "root".to_string(),
            database: "ny_taxi".to_string(),
        }
    }
}

impl DbConfig {
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        match &self.url {
            Some(url) => PgConnectOptions::from_str(url).context("Invalid DATABASE_URL"),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.username)
                .password(&self.password)
                .database(&self.database)),
        }
    }

    /// Where we are connecting, without credentials
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Settings shared by every flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub batch_size: usize,
    pub stage_retries: u32,
    pub cache_ttl_secs: u64,
    pub database: DbConfig,
    pub storage: StorageConfig,
}

impl IngestConfig {
    /// Load configuration from environment variables
    ///
    /// Only malformed values are rejected here. Call [`validate`](Self::validate)
    /// once command line overrides have been applied.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, without validating
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DbConfig::default();
        let database = DbConfig {
            url: lookup("DATABASE_URL"),
            host: lookup("PG_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PG_PORT", DEFAULT_PG_PORT)?,
            username: lookup("PG_USER").unwrap_or(defaults.username),
            password: lookup("PG_PASSWORD").unwrap_or(defaults.password),
            database: lookup("PG_DATABASE").unwrap_or(defaults.database),
        };

        let config = Self {
            data_dir: lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            batch_size: parse_var(&lookup, "BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            stage_retries: parse_var(&lookup, "STAGE_RETRIES", DEFAULT_STAGE_RETRIES)?,
            cache_ttl_secs: parse_var(&lookup, "CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?,
            database,
            storage: StorageConfig::load(&lookup),
        };

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be greater than 0");
        }
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("DATA_DIR cannot be empty");
        }
        self.storage.validate()?;
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Directory holding downloaded files
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            stage_retries: DEFAULT_STAGE_RETRIES,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            database: DbConfig::default(),
            storage: StorageConfig::for_minio("http://localhost:9000", crate::storage::config::DEFAULT_BUCKET),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

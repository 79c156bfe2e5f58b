//! Ingestion configuration
//!
//! Loaded from environment variables (and a `.env` file when present).

use anyhow::Context;
use nrega_common::NregaError;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::fetcher::{FetcherConfig, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use crate::models::DEFAULT_DATA_SOURCE;
use crate::scheduler::{Cadence, SchedulerConfig};
use crate::store::postgres::{
    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS, DEFAULT_DATABASE_MAX_CONNECTIONS, DEFAULT_DATABASE_URL,
};
use crate::store::PgStoreConfig;
use crate::upserter::{DEFAULT_SHORT_CIRCUIT_THRESHOLD, DEFAULT_UPSERT_WORKERS};

/// Default upstream endpoint
pub const DEFAULT_API_URL: &str =
    "https://nregastrep.nic.in/netnrega/dynamic_account_details_ippe.aspx";

/// Default cadence: midnight daily
pub const DEFAULT_SCHEDULE: &str = "0 0 * * *";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Upstream endpoint (`MGNREGA_API_URL`)
    pub api_url: String,
    /// Cron expression or `@every <secs>s`
    pub schedule: String,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    /// Provenance tag written to every record
    pub data_source: String,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub upsert_workers: usize,
    /// Consecutive permanent storage failures that abort a batch (0 disables)
    pub short_circuit_threshold: usize,
    pub run_on_startup: bool,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl IngestConfig {
    /// Load configuration from the environment
    pub fn from_env() -> anyhow::Result<Self> {
        // a missing .env is not an error
        let _ = dotenvy::dotenv();

        let config = Self {
            api_url: env_string("MGNREGA_API_URL", DEFAULT_API_URL),
            schedule: env_string("INGEST_SCHEDULE", DEFAULT_SCHEDULE),
            fetch_timeout_secs: env_parse("INGEST_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)?,
            user_agent: env_string("INGEST_USER_AGENT", DEFAULT_USER_AGENT),
            data_source: env_string("INGEST_DATA_SOURCE", DEFAULT_DATA_SOURCE),
            max_retries: env_parse("INGEST_MAX_RETRIES", 3)?,
            backoff_base_secs: env_parse("INGEST_BACKOFF_BASE_SECS", 60)?,
            backoff_max_secs: env_parse("INGEST_BACKOFF_MAX_SECS", 3600)?,
            upsert_workers: env_parse("INGEST_UPSERT_WORKERS", DEFAULT_UPSERT_WORKERS)?,
            short_circuit_threshold: env_parse(
                "INGEST_SHORT_CIRCUIT_THRESHOLD",
                DEFAULT_SHORT_CIRCUIT_THRESHOLD,
            )?,
            run_on_startup: env_parse("INGEST_RUN_ON_STARTUP", false)?,
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS)?,
                connect_timeout_secs: env_parse(
                    "DATABASE_CONNECT_TIMEOUT_SECS",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> nrega_common::Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(NregaError::config(format!(
                "MGNREGA_API_URL must be an http(s) URL, got '{}'",
                self.api_url
            )));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(NregaError::config("INGEST_FETCH_TIMEOUT_SECS must be greater than 0"));
        }
        if self.upsert_workers == 0 {
            return Err(NregaError::config("INGEST_UPSERT_WORKERS must be greater than 0"));
        }
        if self.backoff_base_secs == 0 {
            return Err(NregaError::config("INGEST_BACKOFF_BASE_SECS must be greater than 0"));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(NregaError::config(
                "INGEST_BACKOFF_MAX_SECS must not be less than INGEST_BACKOFF_BASE_SECS",
            ));
        }
        if self.database.max_connections == 0 {
            return Err(NregaError::config("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }
        if self.database.connect_timeout_secs == 0 {
            return Err(NregaError::config("DATABASE_CONNECT_TIMEOUT_SECS must be greater than 0"));
        }
        self.cadence()?;
        Ok(())
    }

    pub fn cadence(&self) -> nrega_common::Result<Cadence> {
        Cadence::parse(&self.schedule)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig::new(&self.api_url)
            .with_timeout(self.fetch_timeout())
            .with_user_agent(&self.user_agent)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs),
            self.max_retries,
        )
    }

    pub fn scheduler_config(&self) -> nrega_common::Result<SchedulerConfig> {
        Ok(SchedulerConfig::new(self.cadence()?)
            .with_backoff(self.backoff())
            .with_run_on_startup(self.run_on_startup))
    }

    pub fn pg_config(&self) -> PgStoreConfig {
        PgStoreConfig {
            url: self.database.url.clone(),
            max_connections: self.database.max_connections,
            connect_timeout: Duration::from_secs(self.database.connect_timeout_secs),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value '{}'", name, value)),
        _ => Ok(default),
    }
}

//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! unparsable. The database URL is wrapped in `secrecy::SecretString` so it
//! never shows up in logs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::router::RouteTable;
use crate::worker::WorkerConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// TOML file overriding the default bulk routing table.
    pub routes_config: Option<PathBuf>,
    pub worker_poll_interval: Duration,
    pub worker_max_attempts: u32,
    pub lock_sweep_interval: Duration,
    /// Reject answers from requesters without a live reservation.
    pub require_reservation: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let max_attempts: u32 = optional_var("WORKER_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(Error::Config("WORKER_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        let poll_ms: u64 = optional_var("WORKER_POLL_INTERVAL_MS", 2000)?;
        let sweep_secs: u64 = optional_var("LOCK_SWEEP_INTERVAL_SECS", 300)?;
        if poll_ms == 0 || sweep_secs == 0 {
            return Err(Error::Config(
                "WORKER_POLL_INTERVAL_MS and LOCK_SWEEP_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            routes_config: std::env::var("ROUTES_CONFIG").ok().map(PathBuf::from),
            worker_poll_interval: Duration::from_millis(poll_ms),
            worker_max_attempts: max_attempts,
            lock_sweep_interval: Duration::from_secs(sweep_secs),
            require_reservation: optional_var("REQUIRE_RESERVATION", true)?,
        })
    }

    /// The routing table: defaults, overridden by `ROUTES_CONFIG` if set.
    pub fn route_table(&self) -> Result<RouteTable> {
        match &self.routes_config {
            Some(path) => RouteTable::load_from_file(path),
            None => Ok(RouteTable::default()),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.worker_poll_interval,
            max_attempts: self.worker_max_attempts,
            lock_sweep_interval: self.lock_sweep_interval,
            ..WorkerConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| {
                Error::Config(format!("environment variable {name} has invalid value '{raw}'"))
            }),
        Err(_) => Ok(default),
    }
}

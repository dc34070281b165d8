use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Primary database; additional databases come from discovery.
    pub database_url: String,
    pub port: u16,
    /// Schema holding the platform tables.
    pub schema: String,
    pub webhook_secret: Option<String>,
    pub dispatcher_batch_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub max_attempts: u32,
    pub discovery_refresh: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            schema: env::var("TASKMILL_SCHEMA").unwrap_or_else(|_| "infra".to_string()),
            webhook_secret: env::var("WEBHOOK_SECRET").ok(),
            dispatcher_batch_size: parse_or("DISPATCHER_BATCH_SIZE", 25)?,
            poll_interval: Duration::from_millis(parse_or("POLL_INTERVAL_MS", 1_000)?),
            lease_duration: Duration::from_secs(parse_or("LEASE_SECONDS", 60)?),
            max_attempts: parse_or("MAX_ATTEMPTS", 5)?,
            discovery_refresh: Duration::from_secs(parse_or("DISCOVERY_REFRESH_SECONDS", 300)?),
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

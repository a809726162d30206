use std::env;
use std::str::FromStr;

use chrono::Duration;

use crate::aggregation::AggregationConfig;
use crate::calendar::{CalendarError, MarketCalendar};
use crate::cli::Cli;
use crate::runtime::WorkerPools;
use crate::sync::SyncSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub remote_url: String,
    pub remote_api_key: Option<String>,
    pub sync_interval_seconds: u64,
    pub retention_days: i64,
    pub learning_threshold: i64,
    pub sync_workers: usize,
    pub background_workers: usize,
    pub api_port: u16,
    pub calendar_timezone: String,
    pub calendar_open: String,
    pub calendar_close: String,
    pub calendar_holidays: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let database_url = lookup("DATABASE_URL").ok_or("DATABASE_URL is required")?;
        let remote_url = lookup("REMOTE_URL").ok_or("REMOTE_URL is required")?;
        let remote_api_key = lookup("REMOTE_API_KEY").filter(|key| !key.is_empty());

        let config = Self {
            database_url,
            remote_url,
            remote_api_key,
            sync_interval_seconds: parse_or(&lookup, "SYNC_INTERVAL_SECONDS", 300)?,
            retention_days: parse_or(&lookup, "RETENTION_DAYS", 14)?,
            learning_threshold: parse_or(&lookup, "LEARNING_THRESHOLD", 1000)?,
            sync_workers: parse_or(&lookup, "SYNC_WORKERS", 8)?,
            background_workers: parse_or(&lookup, "BACKGROUND_WORKERS", 4)?,
            api_port: parse_or(&lookup, "API_PORT", 8080)?,
            calendar_timezone: lookup("CALENDAR_TIMEZONE")
                .unwrap_or_else(|| "America/New_York".to_string()),
            calendar_open: lookup("CALENDAR_OPEN").unwrap_or_else(|| "09:30".to_string()),
            calendar_close: lookup("CALENDAR_CLOSE").unwrap_or_else(|| "16:00".to_string()),
            calendar_holidays: lookup("CALENDAR_HOLIDAYS").unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Command-line flags win over the environment.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), String> {
        if let Some(url) = &cli.database_url {
            self.database_url = url.clone();
        }
        if let Some(url) = &cli.remote_url {
            self.remote_url = url.clone();
        }
        if let Some(interval) = cli.sync_interval {
            self.sync_interval_seconds = interval;
        }
        if let Some(port) = cli.port {
            self.api_port = port;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), String> {
        if self.sync_interval_seconds == 0 {
            return Err("SYNC_INTERVAL_SECONDS must be greater than zero".to_string());
        }
        if self.retention_days <= 0 {
            return Err("RETENTION_DAYS must be greater than zero".to_string());
        }
        if self.learning_threshold < 0 {
            return Err("LEARNING_THRESHOLD must not be negative".to_string());
        }
        if self.sync_workers == 0 || self.background_workers == 0 {
            return Err("worker pool sizes must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }

    pub fn calendar(&self) -> Result<MarketCalendar, CalendarError> {
        MarketCalendar::from_settings(
            &self.calendar_timezone,
            &self.calendar_open,
            &self.calendar_close,
            &self.calendar_holidays,
        )
    }

    pub fn aggregation(&self) -> AggregationConfig {
        AggregationConfig {
            learning_threshold: self.learning_threshold,
            ..AggregationConfig::default()
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            retention: self.retention(),
            ..SyncSettings::default()
        }
    }

    pub fn worker_pools(&self) -> WorkerPools {
        WorkerPools::new(self.sync_workers, self.background_workers)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, String> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", name)),
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for quayside-environment.

use std::time::Duration;

/// Default database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:quayside.db?mode=rwc";

/// Default name of the service's durable queue.
pub const DEFAULT_QUEUE_NAME: &str = "quayside.service";

/// Environment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL
    pub database_url: String,
    /// Maximum pooled database connections
    pub max_connections: u32,
    /// Worker tasks per queue
    pub num_workers: usize,
    /// Name of the durable queue, also the queue group prefix
    pub queue_name: String,
    /// Build queues without starting their workers (admin commands)
    pub disable_queues: bool,
    /// Bound on jobs buffered in the local queue
    pub local_queue_capacity: usize,
    /// Bound on tracked processes
    pub process_capacity: usize,
    /// Timeout for the initial database ping
    pub ping_timeout: Duration,
    /// Timeout for an explicit connect after a failed ping
    pub dial_timeout: Duration,
    /// How often durable queue workers poll for jobs
    pub queue_poll_interval: Duration,
    /// How often the queue group prunes idle queues
    pub group_prune_frequency: Duration,
    /// Idle time after which a group queue may be pruned
    pub group_ttl: Duration,
    /// Deadline given to `Environment::close`
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 10,
            num_workers: 2,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            disable_queues: false,
            local_queue_capacity: 1024,
            process_capacity: 2048,
            ping_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(10),
            queue_poll_interval: Duration::from_secs(1),
            group_prune_frequency: Duration::from_secs(10 * 60),
            group_ttl: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            database_url: std::env::var("QUAYSIDE_DATABASE_URL")
                .unwrap_or(defaults.database_url),
            max_connections: parse_var("QUAYSIDE_MAX_CONNECTIONS", defaults.max_connections)?,
            num_workers: parse_var("QUAYSIDE_NUM_WORKERS", defaults.num_workers)?,
            queue_name: std::env::var("QUAYSIDE_QUEUE_NAME").unwrap_or(defaults.queue_name),
            disable_queues: std::env::var("QUAYSIDE_DISABLE_QUEUES")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            local_queue_capacity: parse_var(
                "QUAYSIDE_LOCAL_QUEUE_CAPACITY",
                defaults.local_queue_capacity,
            )?,
            process_capacity: parse_var("QUAYSIDE_PROCESS_CAPACITY", defaults.process_capacity)?,
            ping_timeout: parse_millis("QUAYSIDE_PING_TIMEOUT_MS", defaults.ping_timeout)?,
            dial_timeout: parse_millis("QUAYSIDE_DIAL_TIMEOUT_MS", defaults.dial_timeout)?,
            queue_poll_interval: parse_millis(
                "QUAYSIDE_QUEUE_POLL_INTERVAL_MS",
                defaults.queue_poll_interval,
            )?,
            group_prune_frequency: parse_secs(
                "QUAYSIDE_GROUP_PRUNE_FREQUENCY_SECS",
                defaults.group_prune_frequency,
            )?,
            group_ttl: parse_secs("QUAYSIDE_GROUP_TTL_SECS", defaults.group_ttl)?,
            shutdown_timeout: parse_secs(
                "QUAYSIDE_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
        })
    }

    /// Reject configurations that cannot produce a working environment.
    ///
    /// Runs before any resource is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("database url must not be empty"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty"));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("at least one worker is required"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("at least one database connection is required"));
        }
        if self.local_queue_capacity == 0 || self.process_capacity == 0 {
            return Err(ConfigError::Invalid("capacities must be positive"));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(ConfigError::Invalid("queue poll interval must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

fn parse_millis(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parse_var(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn parse_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_var(name, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
    /// The configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

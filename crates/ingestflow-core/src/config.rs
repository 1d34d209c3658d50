// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::consumer::ResultConsumerConfig;

/// Ingestflow configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Connection pool size
    pub max_connections: u32,
    /// Period of the outbox relay in the consumer loop
    pub outbox_poll_interval: Duration,
    /// Maximum outbox rows published per flush
    pub outbox_batch_size: i64,
    /// Attempts for a worker result failing with a transient error
    pub max_redeliveries: u32,
    /// Delay between those attempts
    pub redelivery_delay: Duration,
}

/// Read an optional variable, falling back to `default` when unset.
fn var_or<T: FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `INGESTFLOW_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `INGESTFLOW_MAX_CONNECTIONS`: Pool size (default: 5)
    /// - `INGESTFLOW_OUTBOX_POLL_INTERVAL_MS`: Outbox relay period (default: 5000)
    /// - `INGESTFLOW_OUTBOX_BATCH_SIZE`: Rows per outbox flush (default: 100)
    /// - `INGESTFLOW_MAX_REDELIVERIES`: Attempts per worker result (default: 3)
    /// - `INGESTFLOW_REDELIVERY_DELAY_MS`: Delay between attempts (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("INGESTFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("INGESTFLOW_DATABASE_URL"))?;

        let max_connections: u32 = var_or(
            "INGESTFLOW_MAX_CONNECTIONS",
            5,
            "must be a positive integer",
        )?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "INGESTFLOW_MAX_CONNECTIONS",
                "must be a positive integer",
            ));
        }

        let outbox_poll_interval_ms: u64 = var_or(
            "INGESTFLOW_OUTBOX_POLL_INTERVAL_MS",
            5000,
            "must be a positive number of milliseconds",
        )?;
        if outbox_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "INGESTFLOW_OUTBOX_POLL_INTERVAL_MS",
                "must be a positive number of milliseconds",
            ));
        }

        let outbox_batch_size: i64 = var_or(
            "INGESTFLOW_OUTBOX_BATCH_SIZE",
            100,
            "must be a positive integer",
        )?;
        if outbox_batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "INGESTFLOW_OUTBOX_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let max_redeliveries: u32 = var_or(
            "INGESTFLOW_MAX_REDELIVERIES",
            3,
            "must be a non-negative integer",
        )?;

        let redelivery_delay_ms: u64 = var_or(
            "INGESTFLOW_REDELIVERY_DELAY_MS",
            500,
            "must be a number of milliseconds",
        )?;

        Ok(Self {
            database_url,
            max_connections,
            outbox_poll_interval: Duration::from_millis(outbox_poll_interval_ms),
            outbox_batch_size,
            max_redeliveries,
            redelivery_delay: Duration::from_millis(redelivery_delay_ms),
        })
    }

    /// Settings of the result consumer loop.
    pub fn consumer_config(&self) -> ResultConsumerConfig {
        ResultConsumerConfig {
            max_redeliveries: self.max_redeliveries,
            redelivery_delay: self.redelivery_delay,
            outbox_poll_interval: self.outbox_poll_interval,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: [&str; 5] = [
        "INGESTFLOW_MAX_CONNECTIONS",
        "INGESTFLOW_OUTBOX_POLL_INTERVAL_MS",
        "INGESTFLOW_OUTBOX_BATCH_SIZE",
        "INGESTFLOW_MAX_REDELIVERIES",
        "INGESTFLOW_REDELIVERY_DELAY_MS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: URL set, every optional variable unset.
        fn with_url(url: &str) -> Self {
            let mut guard = Self { vars: Vec::new() };
            guard.set("INGESTFLOW_DATABASE_URL", url);
            for key in OPTIONAL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::with_url("sqlite:ingest.db");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:ingest.db");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.outbox_poll_interval, Duration::from_secs(5));
        assert_eq!(config.outbox_batch_size, 100);
        assert_eq!(config.max_redeliveries, 3);
        assert_eq!(config.redelivery_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::with_url("sqlite::memory:");

        guard.set("INGESTFLOW_MAX_CONNECTIONS", "1");
        guard.set("INGESTFLOW_OUTBOX_POLL_INTERVAL_MS", "250");
        guard.set("INGESTFLOW_OUTBOX_BATCH_SIZE", "10");
        guard.set("INGESTFLOW_MAX_REDELIVERIES", "0");
        guard.set("INGESTFLOW_REDELIVERY_DELAY_MS", "20");

        let config = Config::from_env().unwrap();

        assert_eq!(config.max_connections, 1);
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(250));
        assert_eq!(config.outbox_batch_size, 10);
        assert_eq!(config.max_redeliveries, 0);
        assert_eq!(config.redelivery_delay, Duration::from_millis(20));

        let consumer = config.consumer_config();
        assert_eq!(consumer.outbox_poll_interval, Duration::from_millis(250));
        assert_eq!(consumer.max_redeliveries, 0);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::with_url("unused");
        guard.remove("INGESTFLOW_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("INGESTFLOW_DATABASE_URL")));
        assert!(err.to_string().contains("INGESTFLOW_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();

        for (key, value) in [
            ("INGESTFLOW_MAX_CONNECTIONS", "abc"),
            ("INGESTFLOW_MAX_CONNECTIONS", "0"),
            ("INGESTFLOW_OUTBOX_POLL_INTERVAL_MS", "0"),
            ("INGESTFLOW_OUTBOX_BATCH_SIZE", "-5"),
            ("INGESTFLOW_MAX_REDELIVERIES", "-1"),
            ("INGESTFLOW_REDELIVERY_DELAY_MS", "soon"),
        ] {
            let mut guard = EnvGuard::with_url("sqlite::memory:");
            guard.set(key, value);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(k, _) if k == key),
                "{}={} gave {:?}",
                key,
                value,
                err
            );
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}

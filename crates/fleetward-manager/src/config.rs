// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::daemons::ReconcileConfig;

/// Default database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.data/fleetward.db?mode=rwc";

/// Fleetward configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL.
    pub database_url: String,
    /// Default queue capacity per work area (`None` = unbounded).
    pub queue_capacity: Option<usize>,
    /// Versions kept per versioned entity.
    pub max_versions_to_store: usize,
    /// Deadline for a device to acknowledge quiesce/unquiesce.
    pub quiesce_timeout: Duration,
    /// Deadline for a device to come back after a firmware push.
    pub firmware_reboot_timeout: Duration,
    /// Heartbeat daemon settings.
    pub heartbeat: ReconcileConfig,
    /// Domain-synchronization daemon settings.
    pub domain_sync: ReconcileConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FLEETWARD_DATABASE_URL`: SQLite URL (default: `sqlite:.data/fleetward.db?mode=rwc`)
    /// - `FLEETWARD_QUEUE_CAPACITY`: tasks per work area, 0 for unbounded (default: 0)
    /// - `FLEETWARD_MAX_VERSIONS_TO_STORE`: retained versions (default: 5)
    /// - `FLEETWARD_QUIESCE_TIMEOUT_SECS`: quiesce deadline (default: 30)
    /// - `FLEETWARD_FIRMWARE_REBOOT_TIMEOUT_SECS`: reboot deadline (default: 300)
    /// - `FLEETWARD_HEARTBEAT_*`, `FLEETWARD_DOMAIN_SYNC_*`: see [`ReconcileConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FLEETWARD_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "FLEETWARD_DATABASE_URL",
                "must not be empty",
            ));
        }

        let queue_capacity: usize = parse_var(
            "FLEETWARD_QUEUE_CAPACITY",
            0,
            "must be a non-negative integer",
        )?;

        let max_versions_to_store: usize = parse_var(
            "FLEETWARD_MAX_VERSIONS_TO_STORE",
            5,
            "must be a positive integer",
        )?;
        if max_versions_to_store == 0 {
            return Err(ConfigError::Invalid(
                "FLEETWARD_MAX_VERSIONS_TO_STORE",
                "must be a positive integer",
            ));
        }

        let quiesce_timeout_secs: u64 = parse_var(
            "FLEETWARD_QUIESCE_TIMEOUT_SECS",
            30,
            "must be a number of seconds",
        )?;

        let firmware_reboot_timeout_secs: u64 = parse_var(
            "FLEETWARD_FIRMWARE_REBOOT_TIMEOUT_SECS",
            300,
            "must be a number of seconds",
        )?;

        Ok(Self {
            database_url,
            queue_capacity: (queue_capacity > 0).then_some(queue_capacity),
            max_versions_to_store,
            quiesce_timeout: Duration::from_secs(quiesce_timeout_secs),
            firmware_reboot_timeout: Duration::from_secs(firmware_reboot_timeout_secs),
            heartbeat: ReconcileConfig::from_env(
                "FLEETWARD_HEARTBEAT",
                ReconcileConfig::heartbeat(),
            ),
            domain_sync: ReconcileConfig::from_env(
                "FLEETWARD_DOMAIN_SYNC",
                ReconcileConfig::domain_sync(),
            ),
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    hint: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
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

    const VARS: &[&str] = &[
        "FLEETWARD_DATABASE_URL",
        "FLEETWARD_QUEUE_CAPACITY",
        "FLEETWARD_MAX_VERSIONS_TO_STORE",
        "FLEETWARD_QUIESCE_TIMEOUT_SECS",
        "FLEETWARD_FIRMWARE_REBOOT_TIMEOUT_SECS",
        "FLEETWARD_HEARTBEAT_ENABLED",
        "FLEETWARD_HEARTBEAT_INTERVAL_SECS",
        "FLEETWARD_HEARTBEAT_POOL_SIZE",
        "FLEETWARD_HEARTBEAT_RETRY_MAX",
        "FLEETWARD_HEARTBEAT_RECORD_OUTCOMES",
        "FLEETWARD_DOMAIN_SYNC_ENABLED",
        "FLEETWARD_DOMAIN_SYNC_INTERVAL_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate for every fleetward variable.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
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
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.max_versions_to_store, 5);
        assert_eq!(config.quiesce_timeout, Duration::from_secs(30));
        assert_eq!(config.firmware_reboot_timeout, Duration::from_secs(300));
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.retry_max, 3);
        assert!(!config.heartbeat.record_outcomes);
        assert!(config.domain_sync.enabled);
    }

    #[test]
    fn test_config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FLEETWARD_DATABASE_URL", "sqlite::memory:");
        guard.set("FLEETWARD_QUEUE_CAPACITY", "16");
        guard.set("FLEETWARD_MAX_VERSIONS_TO_STORE", "3");
        guard.set("FLEETWARD_HEARTBEAT_INTERVAL_SECS", "10");
        guard.set("FLEETWARD_HEARTBEAT_POOL_SIZE", "2");
        guard.set("FLEETWARD_HEARTBEAT_RECORD_OUTCOMES", "1");
        guard.set("FLEETWARD_DOMAIN_SYNC_ENABLED", "false");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.queue_capacity, Some(16));
        assert_eq!(config.max_versions_to_store, 3);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat.pool_size, 2);
        assert!(config.heartbeat.record_outcomes);
        assert!(!config.domain_sync.enabled);
    }

    #[test]
    fn test_config_invalid_queue_capacity() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FLEETWARD_QUEUE_CAPACITY", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("FLEETWARD_QUEUE_CAPACITY", _)
        ));
    }

    #[test]
    fn test_config_zero_versions_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FLEETWARD_MAX_VERSIONS_TO_STORE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("FLEETWARD_MAX_VERSIONS_TO_STORE", _)
        ));
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fleetward-manager.
//!
//! Fleet operations report engine errors ([`fleetward_core::Error`]) directly,
//! since they flow through progress containers. This type covers setup:
//! configuration, opening the database, running migrations.

use thiserror::Error;

/// Manager errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Engine or fleet operation failed.
    #[error(transparent)]
    Core(#[from] fleetward_core::Error),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using the manager [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Core(e) => e.error_code(),
            Error::Config(_) => "CONFIG",
            Error::Database(_) => "DATABASE",
            Error::Migration(_) => "MIGRATION",
            Error::Io(_) => "IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_error_code_passes_through_core() {
        let err: Error = fleetward_core::Error::Busy {
            resource: "device:a".to_string(),
        }
        .into();
        assert_eq!(err.error_code(), "BUSY");
        assert_eq!(err.to_string(), "Resource 'device:a' is busy");
    }

    #[test]
    fn test_config_error_wrapped() {
        let err: Error = ConfigError::Missing("FLEETWARD_DATABASE_URL").into();
        assert_eq!(err.error_code(), "CONFIG");
        assert!(err.to_string().contains("FLEETWARD_DATABASE_URL"));
    }
}

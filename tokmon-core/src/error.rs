//! Error types for the tokmon-beam core library.
//!
//! Every failure that can cross a component boundary is a [`BeamError`].
//! Connection-local failures never leave the relay hub; they are logged and
//! the affected observer is dropped.
//!
//! # Error Codes Reference
//!
//! | Code Range | Category | Description |
//! |------------|----------|-------------|
//! | E1001-E1099 | Store | Persistence failures and timeouts |
//! | E2001-E2099 | Config | Missing or invalid configuration |
//! | E3001-E3099 | Input | Malformed ingest payloads |
//! | E4001-E4099 | Cost | Pricing lookups |
//! | E5001-E5099 | Relay | Observer connection faults |
//! | E9001-E9099 | General | Internal and lookup errors |

use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// The main error type for the tokmon-beam core library.
#[derive(Debug, Error)]
pub enum BeamError {
    // ========================================================================
    // Store Errors (E1001-E1099)
    // ========================================================================
    /// The persistence layer rejected or failed a call
    #[error("[E1001] Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A persistence call did not complete within its bound
    #[error("[E1002] Store call '{operation}' timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// A create hit an existing row for the same key
    #[error("[E1003] Summary already exists for conversation '{0}'")]
    AlreadyExists(String),

    // ========================================================================
    // Configuration Errors (E2001-E2099)
    // ========================================================================
    #[error("[E2001] Missing required configuration: {0}")]
    ConfigMissing(String),

    #[error("[E2002] Invalid configuration value for {key}: {message}")]
    ConfigInvalid { key: String, message: String },

    // ========================================================================
    // Input Errors (E3001-E3099)
    // ========================================================================
    /// Rejected before any mutation happened
    #[error("[E3001] Invalid input: {0}")]
    InvalidInput(String),

    #[error("[E3002] Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========================================================================
    // Cost Errors (E4001-E4099)
    // ========================================================================
    #[error("[E4001] Pricing not found for model '{0}'")]
    PricingMissing(String),

    // ========================================================================
    // Relay Errors (E5001-E5099)
    // ========================================================================
    #[error("[E5001] Connection {connection} fault: {message}")]
    ConnectionFault { connection: u64, message: String },

    // ========================================================================
    // General Errors (E9001-E9099)
    // ========================================================================
    #[error("[E9001] Internal error: {0}")]
    Internal(String),

    #[error("[E9002] Not found: {0}")]
    NotFound(String),
}

pub type BeamResult<T> = Result<T, BeamError>;

impl From<sqlx::Error> for BeamError {
    fn from(err: sqlx::Error) -> Self {
        BeamError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BeamError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        BeamError::StoreUnavailable(format!("migration failed: {}", err))
    }
}

impl From<config::ConfigError> for BeamError {
    fn from(err: config::ConfigError) -> Self {
        BeamError::ConfigInvalid {
            key: "config".to_string(),
            message: err.to_string(),
        }
    }
}

impl BeamError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        BeamError::InvalidInput(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        BeamError::StoreUnavailable(message.into())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BeamError::StoreUnavailable(_) => "E1001",
            BeamError::StoreTimeout { .. } => "E1002",
            BeamError::AlreadyExists(_) => "E1003",
            BeamError::ConfigMissing(_) => "E2001",
            BeamError::ConfigInvalid { .. } => "E2002",
            BeamError::InvalidInput(_) => "E3001",
            BeamError::Serialization(_) => "E3002",
            BeamError::PricingMissing(_) => "E4001",
            BeamError::ConnectionFault { .. } => "E5001",
            BeamError::Internal(_) => "E9001",
            BeamError::NotFound(_) => "E9002",
        }
    }

    /// Store failures are the only ones a caller may sensibly retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BeamError::StoreUnavailable(_) | BeamError::StoreTimeout { .. }
        )
    }

    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            BeamError::StoreUnavailable(_)
                | BeamError::StoreTimeout { .. }
                | BeamError::AlreadyExists(_)
        )
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BeamError::InvalidInput(_) | BeamError::Serialization(_)
        )
    }

    pub fn log(&self) {
        let code = self.error_code();
        if self.is_client_error()
            || matches!(
                self,
                BeamError::PricingMissing(_)
                    | BeamError::NotFound(_)
                    | BeamError::ConnectionFault { .. }
            )
        {
            warn!(error_code = code, "{}", self);
        } else {
            error!(error_code = code, "{}", self);
        }
    }

    pub fn to_json_error(&self) -> serde_json::Value {
        serde_json::json!({
            "error": true,
            "code": self.error_code(),
            "message": self.to_string()
        })
    }
}

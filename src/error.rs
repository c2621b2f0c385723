//! Error types for the purge bridge.
//!
//! A single [`PurgemanError`] covers every failure the service can observe,
//! together with the [`Result`] alias used across the crate.
//!
//! # Error Categories
//!
//! - **Configuration**: missing or invalid settings. Fatal, never retried.
//! - **Connection**: broker or catalog unreachable, auth failures, closed
//!   delivery streams. Retried by the orchestrator at a fixed interval.
//! - **Parse**: malformed broker payloads. The message is dropped.
//! - **Purge**: a single cache target failed. Logged, never propagated.
//! - **Handshake**: the background child did not confirm its startup.
//!
//! # Example
//!
//! ```rust
//! use purgeman::error::{PurgemanError, Result};
//!
//! fn require_host(host: &str) -> Result<()> {
//!     if host.is_empty() {
//!         return Err(PurgemanError::InvalidConfig {
//!             field: "broker.host".into(),
//!             reason: "must be given".into(),
//!         });
//!     }
//!     Ok(())
//! }
//!
//! let err = require_host("").unwrap_err();
//! assert!(err.is_config());
//! assert!(!err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for purge bridge operations.
#[derive(Error, Debug)]
pub enum PurgemanError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Connection errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    // Data plane errors
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Purge request failed: {0}")]
    Purge(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Daemon hand-off
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Service is terminating")]
    Terminated,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PurgemanError {
    /// Check if the error is worth another connection attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PurgemanError::ConnectionFailed(_)
                | PurgemanError::Broker(_)
                | PurgemanError::Catalog(_)
                | PurgemanError::NotConnected(_)
        )
    }

    /// Check if the error is an unrecoverable configuration problem.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PurgemanError::Config(_) | PurgemanError::InvalidConfig { .. }
        )
    }
}

impl From<serde_yaml::Error> for PurgemanError {
    fn from(e: serde_yaml::Error) -> Self {
        PurgemanError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for PurgemanError {
    fn from(e: serde_json::Error) -> Self {
        PurgemanError::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for PurgemanError {
    fn from(e: reqwest::Error) -> Self {
        PurgemanError::ConnectionFailed(e.to_string())
    }
}

/// Result type alias for purge bridge operations.
pub type Result<T> = std::result::Result<T, PurgemanError>;

//! WgKeeper Error Types

use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type alias for WgKeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// WgKeeper error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    // Address range errors
    #[error("Invalid address range entry: {0}")]
    RangeFormat(String),

    #[error("Address {0} is not a private-use address")]
    NonPrivateAddress(Ipv4Addr),

    // Change feed errors
    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Malformed change payload on channel {channel}: {reason}")]
    MalformedPayload { channel: String, reason: String },

    // Key generation errors
    #[error("Key generation failed: {0}")]
    Keygen(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error should only skip the current interface's
    /// materialization instead of aborting the reconciliation pass.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::RangeFormat(_)
                | Error::NonPrivateAddress(_)
                | Error::NotFound(_)
                | Error::Io(_)
        )
    }
}

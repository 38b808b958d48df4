// src/error.rs

//! Error types for apprelay

use thiserror::Error;

/// Errors raised by the rotation engine and its directory clients
#[derive(Error, Debug)]
pub enum Error {
    #[error("Directory request failed: {0}")]
    DirectoryError(String),

    #[error("Directory object not found: {0}")]
    NotFound(String),

    /// The directory refused the request as malformed or forbidden
    #[error("Directory rejected request: {0}")]
    Rejected(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Invalid lock pattern '{pattern}': {message}")]
    InvalidLockPattern { pattern: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// The family view could not be read; no safe decision can be made
    #[error("Family '{name}' unavailable after {attempts} attempts: {message}")]
    FamilyUnavailable {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("Publish aborted: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DirectoryError(_) | Error::RetriesExhausted { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

/// Result type for apprelay operations
pub type Result<T> = std::result::Result<T, Error>;

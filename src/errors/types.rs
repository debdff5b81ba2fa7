//! Error type definitions for the M3U validator
//!
//! Only the playlist origin can fail a whole ingestion run. Everything that
//! goes wrong while probing or playing an individual stream is described by
//! [`MediaLoadError`] and carried as data instead of being propagated.

use thiserror::Error;

use crate::models::ValidationStatus;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Playlist origin errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Validation errors for caller supplied input
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Filesystem errors (config file, report export)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Configuration file could not be rendered
    #[error("TOML render error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Playlist origin specific errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// The origin did not answer in time
    #[error("Connection timeout: {url}")]
    Timeout { url: String },

    /// The origin could not be reached at all
    #[error("Source unreachable: {url} - {message}")]
    Unreachable { url: String, message: String },

    /// HTTP errors from the origin
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Invalid source configuration
    #[error("Invalid configuration: {field} - {message}")]
    InvalidConfig { field: String, message: String },
}

/// Failure classes observed while loading a single stream
///
/// Used by both the reachability probes and the playback failover controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaLoadError {
    /// Connection refused, DNS failure, HTTP error status and similar
    #[error("Network error: {0}")]
    Network(String),

    /// Data arrived but could not be decoded
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The container or codec is not supported
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Segmented manifest could not be fetched or parsed
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Loading was aborted on request
    #[error("Load aborted")]
    Aborted,

    /// Anything that is not a media failure (spawn errors, internal bugs)
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl SourceError {
    /// Create a timeout error
    pub fn timeout<U: Into<String>>(url: U) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Create an unreachable error
    pub fn unreachable<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Unreachable {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl MediaLoadError {
    /// Status recorded on a validation result for this failure
    pub fn status(&self) -> ValidationStatus {
        match self {
            Self::Unexpected(_) => ValidationStatus::Error,
            _ => ValidationStatus::Failed,
        }
    }

    /// Whether the failure class may clear up on an in-place retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Manifest(_) | Self::Decode(_))
    }
}

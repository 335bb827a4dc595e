//! Error taxonomy for the synchronization engine.
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`FetchError`] | adapters (network, parse, I/O) | recorded on the source, retried next interval |
//! | [`SyncError::UnknownAdapter`] | worker, adapter registry | recorded; the source keeps failing until fixed |
//! | [`SyncError::UnknownFilter`] | filter pipeline | aborts that cycle, recorded |
//! | [`SyncError::Panicked`] | worker pool | recorded, claim released |
//! | [`ValidationError`] | configuration-time calls | returned to the caller, never persisted |
//!
//! Nothing here is fatal to the process: the worker converts every
//! [`SyncError`] into `last_error` / `last_error_date` on the source.

use thiserror::Error;

/// Failure while retrieving or parsing a source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network failure, including connect/read timeouts.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status (304 is handled as "unchanged", not an error).
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed payload (XML, HTML, JSON).
    #[error("parse error: {0}")]
    Parse(String),

    /// A required configuration key was absent at fetch time.
    #[error("missing configuration key '{0}'")]
    MissingConfig(String),

    /// The persistent store failed while an adapter consulted prior records.
    #[error("store error: {0}")]
    Store(String),
}

impl FetchError {
    pub fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(message: impl std::fmt::Display) -> Self {
        Self::Parse(message.to_string())
    }
}

/// Configuration rejected at the time it is supplied.
#[derive(Debug, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            field: field.into(),
            message: message.to_string(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "required but not set")
    }
}

/// Everything that can end a refresh cycle early.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unknown adapter type '{0}'")]
    UnknownAdapter(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The job's task panicked; recorded by the pool.
    #[error("refresh panicked: {0}")]
    Panicked(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

//! Error kinds for the monitoring core.
//!
//! Per-target failures (fetch, analyze) never leave the worker that produced
//! them; validation and persistence failures surface to the caller of the
//! mutating operation.

use std::time::Duration;

use thiserror::Error;

/// Bad target parameters. Rejected before any state changes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("frequency_hours must be a positive number, got {0}")]
    Frequency(f64),

    #[error("notification_threshold must be within [0, 1], got {0}")]
    Threshold(f64),

    #[error("unknown monitoring type '{0}' (expected url, keyword, topic, arxiv or news)")]
    MonitoringType(String),

    #[error("unknown priority '{0}' (expected low, medium, high or critical)")]
    Priority(String),

    #[error("target must not be empty")]
    EmptyTarget,

    #[error("{0} targets cannot be checked with the configured fetcher")]
    UnsupportedType(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no fetcher available for {0} targets")]
    Unsupported(String),

    #[error("unreadable response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Error)]
pub enum AnalyzeError {
    #[error("analysis timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("analyzer request failed: {0}")]
    Request(String),

    #[error("analyzer returned an unusable response: {0}")]
    Malformed(String),
}

/// Config or findings write failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl PersistenceError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        PersistenceError::Store(err.to_string())
    }
}

/// Errors returned by the host-facing [`crate::monitor::Monitor`] operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Why a scheduled check did not complete normally.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

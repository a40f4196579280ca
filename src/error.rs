//! Error types for the scouting pipeline.
//!
//! Errors are split by the layer that produces them so callers can decide
//! locally whether a failure is recoverable:
//!
//! - [`FetchError`]: page-level failures reported by a session. Timeouts and
//!   missing elements are transient and only end the current extraction
//!   strategy; anything else means the session itself is suspect.
//! - [`PoolError`]: failures to hand out a session.
//! - [`StageError`]: either of the above, as seen by discovery and workers.
//! - [`DispatchError`]: rejected configuration and run-level faults.
//! - [`ConfigError`]: problems loading the YAML configuration file.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {timeout:?} waiting for `{selector}`")]
    Timeout { selector: String, timeout: Duration },
    #[error("no element matches `{0}`")]
    NotFound(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("browser session lost: {0}")]
    SessionLost(String),
    #[error("stop requested")]
    Cancelled,
}

impl FetchError {
    /// Whether this failure only means "nothing here", not a broken session.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout { .. } | FetchError::NotFound(_))
    }

    /// The page failed to load but the session is still usable.
    pub fn is_page_failure(&self) -> bool {
        matches!(self, FetchError::Navigation { .. } | FetchError::Http(_))
    }

    /// Whether the session that produced this error should be thrown away.
    pub fn poisons_session(&self) -> bool {
        matches!(self, FetchError::SessionLost(_))
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no browser session became available within {0:?}")]
    AcquireTimeout(Duration),
    #[error("session pool has been drained")]
    Closed,
    #[error("failed to start browser session: {0}")]
    Create(#[source] FetchError),
}

/// A failed discovery pass or channel attempt.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl StageError {
    /// Worth another attempt with a (possibly fresh) session.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StageError::Fetch(FetchError::Cancelled) | StageError::Pool(PoolError::Closed)
        )
    }

    /// The pool is gone; the run can't continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Pool(PoolError::Closed))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Fetch(FetchError::Cancelled))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("search query is empty")]
    EmptyQuery,
    #[error("worker count must be between 1 and {max}, got {got}")]
    InvalidWorkerCount { got: usize, max: usize },
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("ledger I/O failed: {0}")]
    Ledger(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

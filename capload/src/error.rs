//! Error taxonomy for the capability loader.
//!
//! Variants map to failure kinds, not implementation types: integrity
//! violations and permission denials are hard failures that are never retried
//! or downgraded, while subprocess timeouts stay local to one request.

use thiserror::Error;

/// Error type shared across all loader components.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("metadata fetch failed: {0}")]
    MetadataFetch(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("dependency install failed: {0}")]
    InstallFailure(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("missing or invalid environment variables: {}", keys.join(", "))]
    MissingEnvVars { keys: Vec<String> },

    #[error("sandbox execution failed: {0}")]
    SandboxFailure(String),

    #[error("subprocess call failed: {0}")]
    SubprocessFailure(String),

    #[error("network forward failed: {0}")]
    ForwardFailure(String),

    #[error("failed to spawn subprocess: {0}")]
    SpawnFailure(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("subprocess terminated: {0}")]
    Terminated(String),

    #[error("no handler found for method: {0}")]
    UnknownMethod(String),

    #[error("invalid tool identifier: {0}")]
    InvalidIdentifier(String),

    #[error("cyclic load detected for: {0}")]
    CyclicLoad(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<std::io::Error> for LoaderError {
    fn from(e: std::io::Error) -> Self {
        LoaderError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(e: serde_json::Error) -> Self {
        LoaderError::Serde(e.to_string())
    }
}

impl From<reqwest::Error> for LoaderError {
    fn from(e: reqwest::Error) -> Self {
        LoaderError::Http(e.to_string())
    }
}

pub type LoaderResult<T> = Result<T, LoaderError>;

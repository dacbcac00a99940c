//! Error taxonomy shared by the store, the engine and every handler.

use serde::{Deserialize, Serialize};

/// Classified failure of a backing store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency failure (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),
    /// Network, timeout, 5xx or throttling. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// The store understood the request and refused it (invalid, forbidden).
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no resource set registered for schema version {version}")]
    UnroutableVersion { version: String },
    #[error("validation: {0}")]
    Validation(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self { Error::Validation(msg.into()) }

    /// Only transient store failures are re-attempted inside a pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(StoreError::Transient(_)))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict(_)))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(StoreError::NotFound(_)))
    }

    /// Bad input or deployment mismatch: retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::UnroutableVersion { .. } | Error::Validation(_) | Error::Serialization(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Store(StoreError::NotFound(_)) => "not_found",
            Error::Store(StoreError::AlreadyExists(_)) => "already_exists",
            Error::Store(StoreError::Conflict(_)) => "conflict",
            Error::Store(StoreError::Transient(_)) => "transient",
            Error::Store(StoreError::Rejected(_)) => "rejected",
            Error::UnroutableVersion { .. } => "unroutable",
            Error::Validation(_) => "validation",
            Error::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let transient = Error::from(StoreError::Transient("timeout".into()));
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());

        let conflict = Error::from(StoreError::Conflict("rv".into()));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());

        let unroutable = Error::UnroutableVersion { version: "9.0.0".into() };
        assert!(unroutable.is_fatal());
        assert_eq!(unroutable.kind(), "unroutable");
        assert!(unroutable.to_string().contains("9.0.0"));

        assert!(!Error::from(StoreError::Rejected("forbidden".into())).is_retryable());
    }
}

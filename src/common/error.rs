//! Error types for shardkeeper

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Backend Errors ===
    #[error("Coordination backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Lease {0:#x} expired or could not be renewed")]
    LeaseExpired(i64),

    // === Lock Errors ===
    #[error("Lock unavailable: {name}: {reason}")]
    LockUnavailable { name: String, reason: String },

    #[error("Invalid release of {0}: no reference held")]
    InvalidRelease(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Can the failed operation be retried on a later tick?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_) | Error::LockUnavailable { .. } | Error::Timeout(_)
        )
    }

    /// Does this error end the node's participation in the cluster?
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::LeaseExpired(_))
    }

    pub(crate) fn lock_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::LockUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::BackendUnavailable("down".into()).is_retryable());
        assert!(Error::lock_unavailable("p-1", "timeout").is_retryable());
        assert!(!Error::InvalidRelease("p-1".into()).is_retryable());

        assert!(Error::LeaseExpired(7).is_terminal());
        assert!(!Error::BackendUnavailable("down".into()).is_terminal());
    }

    #[test]
    fn test_display() {
        let err = Error::lock_unavailable("/services/svc/partitions/3", "timed out after 1s");
        assert_eq!(
            err.to_string(),
            "Lock unavailable: /services/svc/partitions/3: timed out after 1s"
        );
        assert_eq!(
            Error::LeaseExpired(0x2a).to_string(),
            "Lease 0x2a expired or could not be renewed"
        );
    }
}

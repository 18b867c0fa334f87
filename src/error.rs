//! Error types for bulkxfer
//!
//! Every failure the engine can surface is a [`TransferError`]. Part-level
//! errors are classified by the retry policy and resolved inside the
//! coordinators; only transfer-level terminal states reach the caller, wrapped
//! in [`TransferError::TransferFailed`] together with a [`ReasonCode`].

use crate::hash::Digest;
use crate::retry::ErrorClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Terminal reason attached to every surfaced failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Connection reset, timeout and similar
    NetworkTransient,
    /// Remote asked us to slow down
    RateLimited,
    /// Remote returned a 5xx
    ServerTransient,
    /// Retry budget used up on a retryable error
    AttemptsExhausted,
    /// Non-retryable remote or local failure
    Terminal,
    /// Content digest did not match after verification
    ChecksumMismatch,
    /// Remote refused the credential or lease
    CredentialRejected,
    /// Invalid input detected before any network activity
    Precondition,
    /// Completion transaction was rejected on every attempt
    CompletionFailed,
    /// Metadata registration after upload failed
    RegistrationFailed,
    /// Invalid or unusable configuration
    Configuration,
}

impl ReasonCode {
    /// Stable snake_case code for logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTransient => "network_transient",
            Self::RateLimited => "rate_limited",
            Self::ServerTransient => "server_transient",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::Terminal => "terminal",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::CredentialRejected => "credential_rejected",
            Self::Precondition => "precondition",
            Self::CompletionFailed => "completion_failed",
            Self::RegistrationFailed => "registration_failed",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for transfer operations
#[derive(Error, Debug)]
pub enum TransferError {
    /// Invalid input: zero-length file, unreadable path, bad request
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Local I/O error with path context
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// File or directory the operation touched
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Connection reset, timeout, DNS failure
    #[error("Network error: {0}")]
    Network(String),

    /// Explicit "too many requests" from the remote
    #[error("Rate limited by remote{}: {message}", .retry_after.map(|d| format!(" (retry after {})", humantime::format_duration(d))).unwrap_or_default())]
    RateLimited {
        /// Server's hint for how long to wait
        retry_after: Option<Duration>,
        /// Remote's response text
        message: String,
    },

    /// Remote 5xx
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP status, 500 and up
        status: u16,
        /// Remote's response text
        message: String,
    },

    /// Remote 4xx other than rate limiting
    #[error("Request rejected with {status}: {message}")]
    Client {
        /// HTTP status in the 4xx range
        status: u16,
        /// Remote's response text
        message: String,
    },

    /// Lease or session credential refused
    #[error("Credential rejected: {0}")]
    CredentialRejected(String),

    /// Digest verification failed
    #[error("Checksum mismatch for '{path}': expected {expected}, observed {actual}")]
    ChecksumMismatch {
        /// File whose content was checked
        path: PathBuf,
        /// Digest the content should have
        expected: Digest,
        /// Digest computed from the content
        actual: Digest,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cache index error (never fatal to a transfer)
    #[error("Cache error: {0}")]
    Cache(String),

    /// Resume sidecar error
    #[error("Sidecar error: {0}")]
    Sidecar(String),

    /// Metadata registration failed after a completed upload
    #[error("Registration of '{remote}' failed: {message}")]
    Registration {
        /// Object that was uploaded
        remote: String,
        /// Registry's error text
        message: String,
    },

    /// Transfer-level terminal failure
    #[error("Transfer of '{remote}' failed [{reason}]: {source}{}", .abort_error.as_ref().map(|e| format!(" (abort also failed: {e})")).unwrap_or_default())]
    TransferFailed {
        /// Object being transferred
        remote: String,
        /// Why the transfer stopped
        reason: ReasonCode,
        /// Last error seen before giving up
        #[source]
        source: Box<TransferError>,
        /// Set when aborting the upload session failed as well
        abort_error: Option<String>,
    },

}

impl TransferError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a precondition error
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a checksum mismatch error
    pub fn checksum_mismatch(path: impl Into<PathBuf>, expected: Digest, actual: Digest) -> Self {
        Self::ChecksumMismatch {
            path: path.into(),
            expected,
            actual,
        }
    }

    /// Wrap into a transfer-level failure
    pub fn into_transfer_failed(self, remote: impl Into<String>, reason: ReasonCode) -> Self {
        Self::TransferFailed {
            remote: remote.into(),
            reason,
            source: Box::new(self),
            abort_error: None,
        }
    }

    /// Attach an abort failure to a transfer-level failure
    pub fn with_abort_error(self, abort: Option<String>) -> Self {
        match self {
            Self::TransferFailed {
                remote,
                reason,
                source,
                ..
            } => Self::TransferFailed {
                remote,
                reason,
                source,
                abort_error: abort,
            },
            other => other,
        }
    }

    /// Classify for the retry policy
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Network(_) => ErrorClass::NetworkTransient,
            Self::RateLimited { retry_after, .. } => ErrorClass::RateLimited {
                retry_after: *retry_after,
            },
            Self::Server { status, .. } if *status >= 500 => ErrorClass::ServerTransient,
            Self::Io { source, .. } if is_transient_io(source) => ErrorClass::NetworkTransient,
            _ => ErrorClass::Terminal,
        }
    }

    /// Reason code this error maps to when it ends a transfer
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::Precondition(_) => ReasonCode::Precondition,
            Self::Network(_) => ReasonCode::NetworkTransient,
            Self::RateLimited { .. } => ReasonCode::RateLimited,
            Self::Server { status, .. } if *status >= 500 => ReasonCode::ServerTransient,
            Self::CredentialRejected(_) => ReasonCode::CredentialRejected,
            Self::ChecksumMismatch { .. } => ReasonCode::ChecksumMismatch,
            Self::Config(_) => ReasonCode::Configuration,
            Self::Registration { .. } => ReasonCode::RegistrationFailed,
            Self::TransferFailed { reason, .. } => *reason,
            _ => ReasonCode::Terminal,
        }
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        self.classify().is_retryable()
    }

    /// Whether the root cause is a rejected credential
    pub fn is_credential_rejection(&self) -> bool {
        match self {
            Self::CredentialRejected(_) => true,
            Self::TransferFailed { source, reason, .. } => {
                *reason == ReasonCode::CredentialRejected || source.is_credential_rejection()
            }
            _ => false,
        }
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } | Self::ChecksumMismatch { path, .. } => Some(path),
            Self::TransferFailed { source, .. } => source.path(),
            _ => None,
        }
    }
}

fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
    )
}

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| TransferError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashAlgorithm;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = TransferError::io("/test/path", io_err);
        assert_eq!(err.path().unwrap(), &PathBuf::from("/test/path"));
        assert_eq!(err.reason(), ReasonCode::Terminal);
    }

    #[test]
    fn test_classification() {
        assert!(TransferError::Network("reset".into()).is_recoverable());
        assert!(TransferError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_recoverable());
        assert!(!TransferError::Client {
            status: 403,
            message: "denied".into()
        }
        .is_recoverable());
        assert!(!TransferError::CredentialRejected("expired".into()).is_recoverable());

        let limited = TransferError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
            message: "slow down".into(),
        };
        assert_eq!(
            limited.classify(),
            ErrorClass::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }

    #[test]
    fn test_mismatch_message_carries_both_digests() {
        let expected = Digest::new(HashAlgorithm::Sha256, "aa".repeat(32));
        let actual = Digest::new(HashAlgorithm::Sha256, "bb".repeat(32));
        let err = TransferError::checksum_mismatch("/tmp/x", expected, actual)
            .into_transfer_failed("obj-1", ReasonCode::ChecksumMismatch);

        let message = err.to_string();
        assert!(message.contains("checksum_mismatch"));
        assert!(message.contains(&"aa".repeat(32)));
        assert!(message.contains(&"bb".repeat(32)));
    }

    #[test]
    fn test_abort_error_is_appended_not_replacing_cause() {
        let err = TransferError::Network("reset".into())
            .into_transfer_failed("obj", ReasonCode::AttemptsExhausted)
            .with_abort_error(Some("abort timed out".into()));

        assert_eq!(err.reason(), ReasonCode::AttemptsExhausted);
        let message = err.to_string();
        assert!(message.contains("reset"));
        assert!(message.contains("abort timed out"));
    }

    #[test]
    fn test_credential_rejection_detection() {
        let err = TransferError::CredentialRejected("lease expired".into())
            .into_transfer_failed("obj", ReasonCode::CredentialRejected);
        assert!(err.is_credential_rejection());
        assert!(!TransferError::Network("x".into()).is_credential_rejection());
    }
}

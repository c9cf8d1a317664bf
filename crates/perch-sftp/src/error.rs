//! Error types for the SFTP server
//!
//! Errors fall into two groups. Startup errors (`Config`, `HostKey`) are fatal
//! to the process. Everything else is scoped to a connection or a single
//! request and is turned into a protocol response at the request boundary.

use russh_sftp::protocol::StatusCode;
use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host key could not be loaded, generated or persisted
    #[error("Host key error: {0}")]
    HostKey(String),

    /// Unknown user or wrong credential
    ///
    /// The message is for the server log only; clients always see the same
    /// rejection regardless of which check failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Client path resolves outside the session root
    #[error("Path escapes session root: {0}")]
    PathEscape(String),

    /// Operation kind is not enabled for this session
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Storage-layer failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unsupported or malformed request method
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Unknown or mismatched file handle
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(String),
}

impl Error {
    /// Whether the error is a request-level authorization failure
    ///
    /// Path escapes are reported as plain denials so clients cannot tell
    /// the two apart.
    pub const fn is_denial(&self) -> bool {
        matches!(self, Self::PathEscape(_) | Self::PermissionDenied(_))
    }

    /// Whether the error should be recorded as a security event
    pub const fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::PathEscape(_) | Self::PermissionDenied(_)
        )
    }

    /// Map this error onto the nearest SFTP status code
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Self::PathEscape(_) | Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
            Self::NotSupported(_) => StatusCode::OpUnsupported,
            _ => StatusCode::Failure,
        }
    }

    /// Error message safe to send to a client
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Authentication(_) => "Authentication failed".to_string(),
            Self::PathEscape(_) | Self::PermissionDenied(_) => "Permission denied".to_string(),
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => "No such file".to_string(),
                std::io::ErrorKind::PermissionDenied => "Permission denied".to_string(),
                _ => "Failure".to_string(),
            },
            Self::Config(_) | Self::HostKey(_) => "Server configuration error".to_string(),
            Self::NotSupported(_) => "Operation not supported".to_string(),
            Self::InvalidHandle(_) => "Invalid handle".to_string(),
            Self::Ssh(_) => "Connection error".to_string(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<Error> for StatusCode {
    fn from(err: Error) -> Self {
        err.to_status_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_is_reported_as_permission_denied() {
        let escape = Error::PathEscape("../../etc/passwd".into());
        assert_eq!(escape.to_status_code(), StatusCode::PermissionDenied);
        assert_eq!(escape.sanitized_message(), "Permission denied");
        assert!(escape.is_denial());
    }

    #[test]
    fn test_storage_errors_map_to_nearest_status() {
        let missing = Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.to_status_code(), StatusCode::NoSuchFile);

        let other = Error::Io(std::io::Error::other("disk full"));
        assert_eq!(other.to_status_code(), StatusCode::Failure);
        assert!(!other.is_denial());
    }

    #[test]
    fn test_sanitized_message_hides_details() {
        let auth = Error::Authentication("user eve not found".into());
        assert_eq!(auth.sanitized_message(), "Authentication failed");

        let perm = Error::PermissionDenied("write /srv/bob/new.txt".into());
        assert_eq!(perm.sanitized_message(), "Permission denied");

        let config = Error::Config("missing root_path".into());
        assert_eq!(config.sanitized_message(), "Server configuration error");
    }

    #[test]
    fn test_not_supported_status() {
        assert_eq!(
            Error::NotSupported("setstat".into()).to_status_code(),
            StatusCode::OpUnsupported
        );
    }

    #[test]
    fn test_is_security_event() {
        assert!(Error::Authentication("x".into()).is_security_event());
        assert!(Error::PathEscape("x".into()).is_security_event());
        assert!(!Error::NotSupported("x".into()).is_security_event());
    }
}

//! Error taxonomy shared by the endpoint, rotator and pool
//!
//! Every failure a caller can observe carries one `ErrorKind`. The kind's
//! stable code prefixes the rendered message (`<code>: <message>`) so callers
//! can pattern-match on the string form as well as on the enum. Layers above
//! the endpoint propagate errors as-is and never re-classify them.

use std::time::Duration;

/// Stable classification of a credential or session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Authentication with a wrong or stale password.
    InvalidCredentials,
    /// The account's password is expired and no replacement was supplied.
    CredentialExpired,
    /// Self-service rotation presented the wrong old password.
    InvalidOldCredential,
    /// The caller lacks the rights for the requested operation.
    InsufficientPrivilege,
    /// A credential-bearing argument is not text. Detected before any I/O.
    InvalidParameterType,
    /// An argument has the right type but an unusable value.
    InvalidParameterValue,
    /// Operation attempted on a closed pool.
    PoolClosed,
    /// No pooled session became available within the acquire timeout.
    PoolTimeout,
    /// The session was logged off or terminated by the server.
    SessionClosed,
    /// The endpoint could not be reached or answered with garbage.
    EndpointUnavailable,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::InvalidCredentials,
        ErrorKind::CredentialExpired,
        ErrorKind::InvalidOldCredential,
        ErrorKind::InsufficientPrivilege,
        ErrorKind::InvalidParameterType,
        ErrorKind::InvalidParameterValue,
        ErrorKind::PoolClosed,
        ErrorKind::PoolTimeout,
        ErrorKind::SessionClosed,
        ErrorKind::EndpointUnavailable,
    ];

    /// Stable code used as the message prefix and on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidCredentials => "invalid-credentials",
            ErrorKind::CredentialExpired => "credential-expired",
            ErrorKind::InvalidOldCredential => "invalid-old-credential",
            ErrorKind::InsufficientPrivilege => "insufficient-privilege",
            ErrorKind::InvalidParameterType => "invalid-parameter-type",
            ErrorKind::InvalidParameterValue => "invalid-parameter-value",
            ErrorKind::PoolClosed => "pool-closed",
            ErrorKind::PoolTimeout => "pool-timeout",
            ErrorKind::SessionClosed => "session-closed",
            ErrorKind::EndpointUnavailable => "endpoint-unavailable",
        }
    }

    /// Parse a wire code back into a kind.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

/// A typed failure: kind plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {}", .kind.code(), .message)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Detail without the code prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_credentials() -> Self {
        Self::new(
            ErrorKind::InvalidCredentials,
            "invalid username/password; logon denied",
        )
    }

    pub fn credential_expired() -> Self {
        Self::new(ErrorKind::CredentialExpired, "the password has expired")
    }

    pub fn invalid_old_credential() -> Self {
        Self::new(ErrorKind::InvalidOldCredential, "invalid old password")
    }

    pub fn insufficient_privilege() -> Self {
        Self::new(ErrorKind::InsufficientPrivilege, "insufficient privileges")
    }

    /// Positional parameter of the wrong type (positions are 1-based).
    pub fn invalid_parameter_type(position: usize) -> Self {
        Self::new(
            ErrorKind::InvalidParameterType,
            format!("invalid type for parameter {position}"),
        )
    }

    /// Named property of an options object with the wrong type.
    pub fn invalid_property_type(name: &str, position: usize) -> Self {
        Self::new(
            ErrorKind::InvalidParameterType,
            format!("invalid type for \"{name}\" in parameter {position}"),
        )
    }

    pub fn invalid_parameter_value(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameterValue, detail)
    }

    pub fn pool_closed() -> Self {
        Self::new(ErrorKind::PoolClosed, "pool is closed")
    }

    pub fn pool_timeout(waited: Duration) -> Self {
        Self::new(
            ErrorKind::PoolTimeout,
            format!("no session available after {}ms", waited.as_millis()),
        )
    }

    pub fn session_closed() -> Self {
        Self::new(ErrorKind::SessionClosed, "session is not connected")
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::EndpointUnavailable, detail)
    }
}

/// Result alias for endpoint, session and pool operations.
pub type Result<T> = std::result::Result<T, Error>;

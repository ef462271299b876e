//! Server endpoint abstraction for credential and session operations
//!
//! Defines the `ServerEndpoint` trait that decouples the session and pool
//! logic from how the database server is actually reached. Two
//! implementations ship with the crate:
//! - `MemoryEndpoint` keeps an in-process account directory (password
//!   verifiers, expiry flags, administrator grants, live sessions)
//! - `HttpEndpoint` talks JSON to a remote credential service
//!
//! Errors from every implementation use the shared `ErrorKind` taxonomy.

pub mod error;
pub mod http;
pub mod memory;

pub use error::{Error, ErrorKind, Result};
pub use http::HttpEndpoint;
pub use memory::MemoryEndpoint;

use common::Secret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Boxed future returned by `ServerEndpoint` methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Rights a session is authenticated with.
///
/// Carried on the session as a capability flag. `Administrator` may rotate any
/// account's password without presenting the old one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeLevel {
    #[default]
    Standard,
    Administrator,
}

impl PrivilegeLevel {
    pub fn is_privileged(&self) -> bool {
        matches!(self, PrivilegeLevel::Administrator)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PrivilegeLevel::Standard => "standard",
            PrivilegeLevel::Administrator => "administrator",
        }
    }
}

impl FromStr for PrivilegeLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(PrivilegeLevel::Standard),
            "administrator" => Ok(PrivilegeLevel::Administrator),
            other => Err(Error::invalid_parameter_value(format!(
                "unknown privilege level \"{other}\""
            ))),
        }
    }
}

/// Opaque server-issued identifier for one authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One authentication attempt.
///
/// When `new_password` is set the server authenticates with `password` and
/// rotates to `new_password` in the same exchange. The returned session is
/// authenticated under the new credential.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub user: String,
    pub password: Secret<String>,
    pub connect_string: String,
    pub privilege: PrivilegeLevel,
    pub new_password: Option<Secret<String>>,
}

/// One credential change, issued from an existing session.
///
/// `old_password` is `None` for privileged changes; the server never checks
/// it in that case.
#[derive(Debug, Clone)]
pub struct CredentialChange {
    pub caller: SessionToken,
    pub user: String,
    pub old_password: Option<Secret<String>>,
    pub new_password: Secret<String>,
    pub as_privileged: bool,
}

/// Abstraction over the database server's authentication surface.
///
/// Implementations report failures with the most specific `ErrorKind` they
/// can; callers propagate them unchanged. Nothing here retries.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ServerEndpoint>`).
pub trait ServerEndpoint: Send + Sync {
    /// Identifier for logging and health reporting (e.g. "memory", "http")
    fn id(&self) -> &str;

    /// Authenticate a new session, optionally rotating the password.
    fn authenticate<'a>(&'a self, request: &'a AuthRequest) -> BoxFuture<'a, Result<SessionToken>>;

    /// Change an account's password on behalf of the calling session.
    fn change_credential<'a>(&'a self, change: &'a CredentialChange) -> BoxFuture<'a, Result<()>>;

    /// Round-trip liveness check for a session.
    fn ping<'a>(&'a self, token: &'a SessionToken) -> BoxFuture<'a, Result<()>>;

    /// Terminate a session on the server.
    fn logoff<'a>(&'a self, token: &'a SessionToken) -> BoxFuture<'a, Result<()>>;
}

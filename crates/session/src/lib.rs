//! Authenticated sessions and credential rotation
//!
//! Provides the client side of the password-management protocol on top of a
//! `ServerEndpoint`. This crate has no pooling; `session-pool` builds on it.
//!
//! Credential flow:
//! 1. Caller builds `ConnectOptions` (typed, or validated from JSON via
//!    `ConnectOptions::from_value`)
//! 2. `SessionHandle::connect()` authenticates; with a `new_password` the
//!    password is rotated in the same exchange (expired-password path)
//! 3. `SessionHandle::change_password()` rotates a password through the
//!    `CredentialRotator`, which picks the self-service or privileged policy
//!    from the session's `PrivilegeLevel`
//! 4. Rotated identities can be persisted with `IdentityStore`

pub mod error;
pub mod handle;
pub mod identity;
pub mod params;
pub mod rotator;

pub use endpoint::{Error, ErrorKind, PrivilegeLevel, Result, ServerEndpoint};
pub use error::{StoreError, StoreResult};
pub use handle::{SessionHandle, SessionId, SessionState};
pub use identity::{Identity, IdentityStore};
pub use params::{ConnectOptions, PasswordChange};
pub use rotator::{CredentialRotator, RotationPolicy};

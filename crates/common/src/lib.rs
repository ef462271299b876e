//! Shared types for the credential gateway workspace
//!
//! `Secret` wraps every password that crosses a crate boundary so it can be
//! logged and debug-printed without leaking. `Error` covers configuration
//! loading shared by the service binaries.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

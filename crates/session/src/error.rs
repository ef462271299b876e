//! Error types for identity persistence
//!
//! Protocol failures use `endpoint::Error`; this module only covers the
//! on-disk identity store.

/// Errors from `IdentityStore` operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("identity file parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

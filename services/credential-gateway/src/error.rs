//! Service-specific error types
//!
//! Per-request failures are `endpoint::Error`s rendered by the API layer;
//! this enum covers startup failures that abort the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("identity store: {0}")]
    Store(#[from] session::StoreError),

    #[error("credential endpoint: {0}")]
    Endpoint(#[from] endpoint::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

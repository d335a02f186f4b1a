//! Crate-wide error kinds.
//!
//! Validation and permission errors are surfaced to the immediate caller
//! (control-plane or HTTP). `Io` errors encountered while serving an
//! already-known item cause that item to be evicted rather than retried.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PassimError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("discovery daemon error: {0}")]
    Upstream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PassimError>;

//! Lease file errors

use thiserror::Error;

/// Errors from reading a lease file; parsing itself never fails
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Failed to read lease file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lease file reader task failed: {0}")]
    Join(String),
}

/// Result type for lease parsing
pub type Result<T> = std::result::Result<T, LeaseError>;

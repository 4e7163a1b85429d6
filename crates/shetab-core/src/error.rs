//! Error types for Shetab core

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in Shetab core
#[derive(Debug, Error)]
pub enum ShetabError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid destination {path:?}: {reason}")]
    InvalidDestination { path: PathBuf, reason: String },

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Server ignored range request for segment {index} (status {status})")]
    RangeIgnored { index: u32, status: u16 },

    #[error("Stream ended early: received {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("Server sent more than the {expected} bytes requested")]
    Overflow { expected: u64 },

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("Merge failed: {0}")]
    Merge(String),
}

impl ShetabError {
    /// Errors that belong to the synchronous `submit` validation step
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ShetabError::InvalidUrl(_) | ShetabError::InvalidDestination { .. }
        )
    }
}

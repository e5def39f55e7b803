//! Engine error types.

use strayfile_core::{ScanError, ScanId, StoreError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that prevent a scan from starting or end it as `Failed`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another scan holds the single-scan slot.
    #[error("A scan is already running{}", .id.map(|id| format!(" (scan {id})")).unwrap_or_default())]
    ScanAlreadyRunning { id: Option<ScanId> },

    /// Resume was requested but the latest scan is not resumable.
    #[error("No interrupted or cancelled scan to resume")]
    NothingToResume,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    /// A blocking or spawned task did not complete.
    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

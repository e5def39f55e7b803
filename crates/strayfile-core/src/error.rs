//! Error types for scanning and persistence.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors that abort a filesystem walk.
///
/// Anything below the roots degrades to a [`ScanWarning`] instead.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Root path is inaccessible: {path}: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Root path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// The walk hit the configured error ceiling.
    #[error("Walk aborted after {count} errors")]
    TooManyErrors { count: u64 },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Errors raised by a persistence gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A write conflicts with stored state.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// What went wrong with a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    PermissionDenied,
    BrokenSymlink,
    /// Directory listing failed.
    ReadError,
    /// `stat` failed on an entry that was listed.
    MetadataError,
    HashError,
    /// Members of a hardlink group report different sizes.
    SizeMismatch,
}

/// A per-entry problem. Recorded on the scan and never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub message: String,
    pub kind: WarningKind,
}

impl ScanWarning {
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>, kind: WarningKind) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn broken_symlink(path: impl Into<PathBuf>, target: &str) -> Self {
        let path = path.into();
        let message = format!("Dangling symlink {} -> {target}", path.display());
        Self::new(path, message, WarningKind::BrokenSymlink)
    }

    /// Wrap an I/O failure. `EACCES` is reported as
    /// [`WarningKind::PermissionDenied`] whatever `kind` says.
    pub fn from_io(path: impl Into<PathBuf>, error: &std::io::Error, kind: WarningKind) -> Self {
        let path = path.into();
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            let message = format!("Permission denied: {}", path.display());
            return Self::new(path, message, WarningKind::PermissionDenied);
        }
        let message = format!("{}: {error}", path.display());
        Self::new(path, message, kind)
    }
}

impl std::fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

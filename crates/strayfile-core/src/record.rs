//! File, usage and disk-location records.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Unique identifier for a stored file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    /// Create a new FileId from a u64.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an external media service (e.g. `radarr`, `plex`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(CompactString);

impl ServiceId {
    /// Create a service id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(CompactString::new(id.as_ref()))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ServiceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// BLAKE3 content hash for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the hash as a hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Inode information for hardlink detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeInfo {
    /// Inode number.
    pub inode: u64,
    /// Device ID.
    pub device: u64,
}

impl InodeInfo {
    /// Create new inode info.
    pub fn new(inode: u64, device: u64) -> Self {
        Self { inode, device }
    }
}

/// Progressive hash level. `0` means unhashed.
pub type HashLevel = u8;

/// Prefix sizes used by progressive hashing.
///
/// Level `k` (1-based) hashes the first `levels[k - 1]` bytes of a file. The
/// level after the last configured prefix hashes the whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashLevels(Vec<u64>);

impl HashLevels {
    /// Default prefixes: 1 MiB, 10 MiB, 100 MiB, 1 GiB.
    pub const DEFAULT: [u64; 4] = [1 << 20, 10 << 20, 100 << 20, 1 << 30];

    pub fn new(prefixes: Vec<u64>) -> Self {
        Self(prefixes)
    }

    pub fn prefixes(&self) -> &[u64] {
        &self.0
    }

    /// The level that hashes the whole file.
    pub fn full_level(&self) -> HashLevel {
        (self.0.len() + 1).min(HashLevel::MAX as usize) as HashLevel
    }

    /// Number of bytes hashed at `level` for a file of `file_size` bytes.
    pub fn bytes_for(&self, level: HashLevel, file_size: u64) -> u64 {
        match level {
            0 => 0,
            l if (l as usize) <= self.0.len() => self.0[l as usize - 1].min(file_size),
            _ => file_size,
        }
    }

    /// Whether a hash at `level` already covers the entire file.
    pub fn covers_file(&self, level: HashLevel, file_size: u64) -> bool {
        level > 0 && self.bytes_for(level, file_size) >= file_size
    }
}

impl Default for HashLevels {
    fn default() -> Self {
        Self(Self::DEFAULT.to_vec())
    }
}

/// One on-disk entry as observed by the walker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedFile {
    pub path: PathBuf,
    pub size: u64,
    pub inode: u64,
    pub device_id: u64,
    pub modified: DateTime<Utc>,
}

impl ObservedFile {
    /// Lowercased extension of the observed path, if any.
    pub fn extension(&self) -> Option<CompactString> {
        extension_of(&self.path)
    }
}

pub(crate) fn extension_of(path: &Path) -> Option<CompactString> {
    path.extension()
        .map(|e| CompactString::new(e.to_string_lossy().to_lowercase()))
}

/// A known file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    /// Canonical on-disk path; the identity key.
    pub path: PathBuf,
    pub size: u64,
    pub inode: u64,
    pub device_id: u64,
    pub modified: DateTime<Utc>,
    /// Last time the walker confirmed this file exists.
    pub last_verified: DateTime<Utc>,
    /// No enabled service references this file.
    pub is_orphaned: bool,
    pub extension: Option<CompactString>,
    pub content_hash: Option<ContentHash>,
    /// Level of `content_hash`, `0` when unhashed.
    pub hash_level: HashLevel,
    /// Leading bytes covered by `content_hash`.
    #[serde(default)]
    pub hash_bytes: u64,
}

impl FileRecord {
    /// Build a fresh record from a walker observation.
    pub fn from_observed(id: FileId, observed: &ObservedFile, verified_at: DateTime<Utc>) -> Self {
        Self {
            id,
            path: observed.path.clone(),
            size: observed.size,
            inode: observed.inode,
            device_id: observed.device_id,
            modified: observed.modified,
            last_verified: verified_at,
            is_orphaned: false,
            extension: observed.extension(),
            content_hash: None,
            hash_level: 0,
            hash_bytes: 0,
        }
    }

    /// Hardlink identity of this file.
    pub fn inode_info(&self) -> InodeInfo {
        InodeInfo::new(self.inode, self.device_id)
    }

    /// Whether `(size, modified)` still match an observation.
    pub fn matches(&self, observed: &ObservedFile) -> bool {
        self.size == observed.size && self.modified == observed.modified
    }

    pub fn is_hashed(&self) -> bool {
        self.hash_level > 0 && self.content_hash.is_some()
    }
}

/// Optional descriptive data a service attaches to a reported file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    /// Title of the owning media item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Service-side identifier of the owning item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A service's claim on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub file_id: FileId,
    pub service: ServiceId,
    /// Path as the service reported it, before translation.
    pub reference_path: String,
    #[serde(default)]
    pub metadata: Option<UsageMetadata>,
}

/// A reported file whose translated path has no FileRecord. Scan scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMissingEntry {
    pub service: ServiceId,
    pub reported_path: String,
    /// `None` when no mapping rule applied.
    pub translated_path: Option<PathBuf>,
    pub size: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

/// Location of a canonical file on one physical disk of a pooled volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiskLocation {
    pub file_id: FileId,
    pub disk_device_id: u64,
    /// Path of the file on the physical disk branch.
    pub disk_path: PathBuf,
}

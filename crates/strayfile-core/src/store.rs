//! Persistence gateway contract.
//!
//! The scan engine never talks to a storage engine directly. Everything it
//! needs from durable storage goes through [`PersistenceGateway`]; schema,
//! migrations and connection handling live behind the implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::record::{
    ContentHash, FileDiskLocation, FileId, FileRecord, HashLevel, ObservedFile, ServiceId,
    ServiceMissingEntry, UsageRecord,
};
use crate::scan::{NewScan, ScanId, ScanRecord};

/// Result type for gateway operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`PersistenceGateway::upsert_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpsert {
    pub record: FileRecord,
    /// `true` when no record existed for the path.
    pub inserted: bool,
}

/// Sort key for file listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    Path,
    Size,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter, sort and page parameters for file listings.
#[derive(Debug, Clone, Default)]
pub struct FileQuery {
    pub orphaned: Option<bool>,
    /// Only files referenced by this service.
    pub service: Option<ServiceId>,
    /// Only files sharing `(device, inode)` with another record.
    pub hardlinked_only: bool,
    pub path_prefix: Option<PathBuf>,
    /// Only files whose `last_verified` is strictly before this instant.
    pub verified_before: Option<DateTime<Utc>>,
    pub min_size: Option<u64>,
    pub sort: SortField,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl FileQuery {
    /// Every file, path order, no paging.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn orphaned(mut self, orphaned: bool) -> Self {
        self.orphaned = Some(orphaned);
        self
    }

    pub fn service(mut self, service: impl Into<ServiceId>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn hardlinked_only(mut self) -> Self {
        self.hardlinked_only = true;
        self
    }

    pub fn under(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn verified_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.verified_before = Some(cutoff);
        self
    }

    pub fn min_size(mut self, size: u64) -> Self {
        self.min_size = Some(size);
        self
    }

    pub fn sorted_by(mut self, sort: SortField, order: SortOrder) -> Self {
        self.sort = sort;
        self.order = order;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Storage operations required by the scan engine.
///
/// Implementations must be safe to share across threads; the engine calls
/// into the gateway from the walker thread and from concurrent service
/// reconciliation tasks.
pub trait PersistenceGateway: Send + Sync {
    // --- files ---

    /// Insert or fully update the record keyed by `observed.path`.
    fn upsert_file(&self, observed: &ObservedFile, verified_at: DateTime<Utc>)
    -> StoreResult<FileUpsert>;

    fn file(&self, id: FileId) -> StoreResult<Option<FileRecord>>;

    fn file_by_path(&self, path: &Path) -> StoreResult<Option<FileRecord>>;

    /// Refresh `last_verified` only.
    fn touch_verified(&self, id: FileId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Delete a file together with its usages and disk locations.
    fn delete_file(&self, id: FileId) -> StoreResult<()>;

    fn list_files(&self, query: &FileQuery) -> StoreResult<Vec<FileRecord>>;

    /// Count matching files, ignoring paging.
    fn count_files(&self, query: &FileQuery) -> StoreResult<u64>;

    fn set_orphaned(&self, updates: &[(FileId, bool)]) -> StoreResult<()>;

    /// Store a hash of the first `bytes` bytes of a file, reached at `level`.
    fn set_content_hash(
        &self,
        id: FileId,
        hash: ContentHash,
        level: HashLevel,
        bytes: u64,
    ) -> StoreResult<()>;

    // --- usages ---

    /// Insert or replace the usage keyed by `(file_id, service)`.
    fn upsert_usage(&self, usage: &UsageRecord) -> StoreResult<()>;

    fn usages_for_file(&self, id: FileId) -> StoreResult<Vec<UsageRecord>>;

    fn usages_for_service(&self, service: &ServiceId) -> StoreResult<Vec<UsageRecord>>;

    /// Number of usages per file; files without usages are absent.
    fn usage_counts(&self, ids: &[FileId]) -> StoreResult<HashMap<FileId, u64>>;

    /// Delete usages of `service` whose file is not in `keep`. Returns the count removed.
    fn prune_usages(&self, service: &ServiceId, keep: &HashSet<FileId>) -> StoreResult<u64>;

    // --- scans ---

    fn create_scan(&self, new: NewScan) -> StoreResult<ScanRecord>;

    /// Persist a scan. Fails with `Conflict` once the stored record is terminal.
    fn update_scan(&self, scan: &ScanRecord) -> StoreResult<()>;

    fn scan(&self, id: ScanId) -> StoreResult<Option<ScanRecord>>;

    /// The scan currently marked `Running`, if any.
    fn running_scan(&self) -> StoreResult<Option<ScanRecord>>;

    /// The most recent `Interrupted` or `Cancelled` scan.
    fn last_interrupted_scan(&self) -> StoreResult<Option<ScanRecord>>;

    /// Most recent scans first.
    fn recent_scans(&self, limit: usize) -> StoreResult<Vec<ScanRecord>>;

    fn append_scan_log(&self, id: ScanId, line: &str) -> StoreResult<()>;

    fn scan_log(&self, id: ScanId) -> StoreResult<Vec<String>>;

    // --- disk locations ---

    /// Insert or replace the location keyed by `(file_id, disk_device_id)`.
    fn upsert_disk_location(&self, location: &FileDiskLocation) -> StoreResult<()>;

    fn disk_locations(&self, file: FileId) -> StoreResult<Vec<FileDiskLocation>>;

    fn delete_disk_locations(&self, file: FileId) -> StoreResult<()>;

    // --- scan-scoped missing entries ---

    fn clear_service_missing(&self) -> StoreResult<()>;

    fn record_service_missing(&self, entries: &[ServiceMissingEntry]) -> StoreResult<()>;

    fn service_missing(&self, service: Option<&ServiceId>)
    -> StoreResult<Vec<ServiceMissingEntry>>;
}

//! Synchronising walked entries with stored file records.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use strayfile_core::{
    FileQuery, ObservedFile, PersistenceGateway, ScanWarning, StoreResult, WarningKind,
};

use crate::walker::observe;

/// How a walked entry is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// Every entry is fully upserted.
    Full,
    /// Entries whose size and mtime match the stored record only refresh
    /// `last_verified`.
    Incremental,
}

/// What [`sync_entry`] did with one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Inserted,
    Updated,
    /// Unchanged; only `last_verified` was refreshed.
    Verified,
}

/// Per-outcome counters for a walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub inserted: u64,
    pub updated: u64,
    pub verified: u64,
}

impl SyncCounts {
    pub fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Inserted => self.inserted += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Verified => self.verified += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.verified
    }

    /// Records whose stored fields changed beyond `last_verified`.
    pub fn changed(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Write one observed entry to the store.
pub fn sync_entry(
    store: &dyn PersistenceGateway,
    observed: &ObservedFile,
    mode: WalkMode,
    now: DateTime<Utc>,
) -> StoreResult<SyncOutcome> {
    if mode == WalkMode::Incremental {
        if let Some(existing) = store.file_by_path(&observed.path)? {
            if existing.matches(observed) {
                store.touch_verified(existing.id, now)?;
                return Ok(SyncOutcome::Verified);
            }
        }
    }

    let upsert = store.upsert_file(observed, now)?;
    if upsert.inserted {
        trace!(path = %observed.path.display(), "new file");
        Ok(SyncOutcome::Inserted)
    } else {
        Ok(SyncOutcome::Updated)
    }
}

/// What [`sweep_unverified`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepCounts {
    pub deleted: u64,
    /// Unverified records kept because they lie under an unreadable directory.
    pub spared: u64,
}

/// Delete every record not verified since `cutoff`, except those under
/// `unreadable` directories, whose absence the walk could not confirm.
///
/// Runs in pages of `batch` so a large library is never listed at once.
pub fn sweep_unverified(
    store: &dyn PersistenceGateway,
    cutoff: DateTime<Utc>,
    batch: usize,
    unreadable: &[PathBuf],
) -> StoreResult<SweepCounts> {
    let batch = batch.max(1);
    let mut counts = SweepCounts::default();
    // spared records stay in the listing, deleted ones leave it
    let mut offset = 0;
    loop {
        let stale = store.list_files(&FileQuery::all().verified_before(cutoff).page(offset, batch))?;
        if stale.is_empty() {
            break;
        }
        for record in stale {
            if unreadable.iter().any(|dir| record.path.starts_with(dir)) {
                trace!(path = %record.path.display(), "kept under unreadable directory");
                counts.spared += 1;
                offset += 1;
                continue;
            }
            debug!(path = %record.path.display(), "file no longer on disk");
            store.delete_file(record.id)?;
            counts.deleted += 1;
        }
    }
    Ok(counts)
}

/// Result of re-checking a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanOutcome {
    Upserted(SyncOutcome),
    /// The path is gone and its record was deleted.
    Deleted,
    /// The path is gone and nothing was stored for it.
    Absent,
    /// The path could not be stat'ed; the record is left untouched.
    Failed(ScanWarning),
}

/// Re-stat one path and bring its record in line with the filesystem.
pub fn rescan_path(
    store: &dyn PersistenceGateway,
    path: &Path,
    now: DateTime<Utc>,
) -> StoreResult<RescanOutcome> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_file() => {
            let observed = observe(path, &metadata);
            sync_entry(store, &observed, WalkMode::Full, now).map(RescanOutcome::Upserted)
        }
        Ok(_) => remove_record(store, path),
        Err(err) if err.kind() == ErrorKind::NotFound => remove_record(store, path),
        Err(err) => Ok(RescanOutcome::Failed(ScanWarning::from_io(
            path,
            &err,
            WarningKind::MetadataError,
        ))),
    }
}

fn remove_record(store: &dyn PersistenceGateway, path: &Path) -> StoreResult<RescanOutcome> {
    match store.file_by_path(path)? {
        Some(record) => {
            store.delete_file(record.id)?;
            Ok(RescanOutcome::Deleted)
        }
        None => Ok(RescanOutcome::Absent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use strayfile_core::MemoryStore;

    fn observed(path: &str, size: u64, mtime: i64) -> ObservedFile {
        ObservedFile {
            path: PathBuf::from(path),
            size,
            inode: 1,
            device_id: 1,
            modified: DateTime::from_timestamp(mtime, 0).unwrap(),
        }
    }

    #[test]
    fn test_incremental_unchanged_only_touches() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let file = observed("/m/a.mkv", 10, 1000);
        assert_eq!(sync_entry(&store, &file, WalkMode::Incremental, t0).unwrap(), SyncOutcome::Inserted);

        let t1 = t0 + Duration::seconds(5);
        assert_eq!(sync_entry(&store, &file, WalkMode::Incremental, t1).unwrap(), SyncOutcome::Verified);
        let record = store.file_by_path(&file.path).unwrap().unwrap();
        assert_eq!(record.last_verified, t1);

        let changed = observed("/m/a.mkv", 11, 1000);
        assert_eq!(sync_entry(&store, &changed, WalkMode::Incremental, t1).unwrap(), SyncOutcome::Updated);
    }

    #[test]
    fn test_full_mode_always_upserts() {
        let store = MemoryStore::new();
        let file = observed("/m/a.mkv", 10, 1000);
        sync_entry(&store, &file, WalkMode::Full, Utc::now()).unwrap();
        assert_eq!(sync_entry(&store, &file, WalkMode::Full, Utc::now()).unwrap(), SyncOutcome::Updated);
    }

    #[test]
    fn test_sweep_pages_through_stale_records() {
        let store = MemoryStore::new();
        let old = Utc::now() - Duration::hours(1);
        for i in 0..7 {
            store.upsert_file(&observed(&format!("/m/{i}.mkv"), i, 1), old).unwrap();
        }
        let now = Utc::now();
        store.upsert_file(&observed("/m/keep.mkv", 1, 1), now).unwrap();

        let counts = sweep_unverified(&store, now, 3, &[]).unwrap();
        assert_eq!(counts, SweepCounts { deleted: 7, spared: 0 });
        assert_eq!(store.count_files(&FileQuery::all()).unwrap(), 1);
    }

    #[test]
    fn test_sweep_spares_unreadable_directories() {
        let store = MemoryStore::new();
        let old = Utc::now() - Duration::hours(1);
        for i in 0..4 {
            store.upsert_file(&observed(&format!("/m/show/{i}.mkv"), i, 1), old).unwrap();
            store.upsert_file(&observed(&format!("/m/movie{i}.mkv"), i, 1), old).unwrap();
        }
        // a sibling sharing the name prefix is not under the directory
        store.upsert_file(&observed("/m/show2/x.mkv", 1, 1), old).unwrap();

        let counts = sweep_unverified(&store, Utc::now(), 2, &[PathBuf::from("/m/show")]).unwrap();
        assert_eq!(counts, SweepCounts { deleted: 5, spared: 4 });
        let left = store.list_files(&FileQuery::all()).unwrap();
        assert_eq!(left.len(), 4);
        assert!(left.iter().all(|f| f.path.starts_with("/m/show")));
    }

    #[test]
    fn test_rescan_missing_path_deletes_record() {
        let store = MemoryStore::new();
        let file = observed("/definitely/not/here.mkv", 1, 1);
        store.upsert_file(&file, Utc::now()).unwrap();

        assert_eq!(rescan_path(&store, &file.path, Utc::now()).unwrap(), RescanOutcome::Deleted);
        assert_eq!(rescan_path(&store, &file.path, Utc::now()).unwrap(), RescanOutcome::Absent);
    }
}

//! In-memory persistence gateway with JSON snapshots.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::{
    ContentHash, FileDiskLocation, FileId, FileRecord, HashLevel, ObservedFile, ServiceId,
    ServiceMissingEntry, UsageRecord, extension_of,
};
use crate::scan::{NewScan, ScanId, ScanRecord, ScanStatus};
use crate::store::{
    FileQuery, FileUpsert, PersistenceGateway, SortField, SortOrder, StoreResult,
};

/// Log lines kept per scan.
const MAX_SCAN_LOG_LINES: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    next_file_id: u64,
    next_scan_id: u64,
    files: HashMap<FileId, FileRecord>,
    by_path: BTreeMap<PathBuf, FileId>,
    usages: HashMap<FileId, BTreeMap<ServiceId, UsageRecord>>,
    scans: BTreeMap<ScanId, ScanRecord>,
    scan_logs: HashMap<ScanId, VecDeque<String>>,
    disk_locations: HashMap<FileId, BTreeMap<u64, FileDiskLocation>>,
    missing: Vec<ServiceMissingEntry>,
}

/// Serialized form of a [`MemoryStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_file_id: u64,
    next_scan_id: u64,
    files: Vec<FileRecord>,
    usages: Vec<UsageRecord>,
    scans: Vec<ScanRecord>,
    #[serde(default)]
    scan_logs: Vec<(ScanId, VecDeque<String>)>,
    #[serde(default)]
    disk_locations: Vec<FileDiskLocation>,
}

/// A [`PersistenceGateway`] kept entirely in memory.
///
/// Used by tests and by the command line tool, which saves it as a JSON
/// snapshot between runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`MemoryStore::save`].
    pub fn load(path: &Path) -> StoreResult<Self> {
        let data = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Load a snapshot, or start empty if the file does not exist.
    pub fn open(path: &Path) -> StoreResult<Self> {
        match fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a snapshot. Scan-scoped missing entries are not persisted.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let snapshot = {
            let inner = self.inner.read();
            Snapshot {
                next_file_id: inner.next_file_id,
                next_scan_id: inner.next_scan_id,
                files: inner.files.values().cloned().collect(),
                usages: inner
                    .usages
                    .values()
                    .flat_map(|m| m.values().cloned())
                    .collect(),
                scans: inner.scans.values().cloned().collect(),
                scan_logs: inner
                    .scan_logs
                    .iter()
                    .map(|(id, lines)| (*id, lines.clone()))
                    .collect(),
                disk_locations: inner
                    .disk_locations
                    .values()
                    .flat_map(|m| m.values().cloned())
                    .collect(),
            }
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut inner = Inner {
            next_file_id: snapshot.next_file_id,
            next_scan_id: snapshot.next_scan_id,
            ..Default::default()
        };
        for file in snapshot.files {
            inner.by_path.insert(file.path.clone(), file.id);
            inner.files.insert(file.id, file);
        }
        for usage in snapshot.usages {
            inner
                .usages
                .entry(usage.file_id)
                .or_default()
                .insert(usage.service.clone(), usage);
        }
        for scan in snapshot.scans {
            inner.scans.insert(scan.id, scan);
        }
        inner.scan_logs = snapshot.scan_logs.into_iter().collect();
        for location in snapshot.disk_locations {
            inner
                .disk_locations
                .entry(location.file_id)
                .or_default()
                .insert(location.disk_device_id, location);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Insert a scan record verbatim. Lets callers seed crash scenarios.
    pub fn insert_scan(&self, scan: ScanRecord) {
        let mut inner = self.inner.write();
        inner.next_scan_id = inner.next_scan_id.max(scan.id.0 + 1);
        inner.scans.insert(scan.id, scan);
    }
}

impl Inner {
    fn matches(&self, file: &FileRecord, query: &FileQuery, hardlinked: &HashSet<(u64, u64)>) -> bool {
        if let Some(orphaned) = query.orphaned {
            if file.is_orphaned != orphaned {
                return false;
            }
        }
        if let Some(ref service) = query.service {
            let used = self
                .usages
                .get(&file.id)
                .is_some_and(|m| m.contains_key(service));
            if !used {
                return false;
            }
        }
        if query.hardlinked_only && !hardlinked.contains(&(file.device_id, file.inode)) {
            return false;
        }
        if let Some(ref prefix) = query.path_prefix {
            if !file.path.starts_with(prefix) {
                return false;
            }
        }
        if let Some(cutoff) = query.verified_before {
            if file.last_verified >= cutoff {
                return false;
            }
        }
        if let Some(min) = query.min_size {
            if file.size < min {
                return false;
            }
        }
        true
    }

    fn hardlinked_identities(&self) -> HashSet<(u64, u64)> {
        let mut counts: HashMap<(u64, u64), usize> = HashMap::new();
        for file in self.files.values() {
            *counts.entry((file.device_id, file.inode)).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(k, _)| k)
            .collect()
    }

    fn select(&self, query: &FileQuery) -> Vec<&FileRecord> {
        let hardlinked = if query.hardlinked_only {
            self.hardlinked_identities()
        } else {
            HashSet::new()
        };
        // by_path iterates in path order, which is the default sort
        let mut selected: Vec<&FileRecord> = self
            .by_path
            .values()
            .filter_map(|id| self.files.get(id))
            .filter(|f| self.matches(f, query, &hardlinked))
            .collect();
        match query.sort {
            SortField::Path => {}
            SortField::Size => selected.sort_by(|a, b| a.size.cmp(&b.size).then(a.path.cmp(&b.path))),
            SortField::Modified => {
                selected.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.path.cmp(&b.path)))
            }
        }
        if query.order == SortOrder::Descending {
            selected.reverse();
        }
        selected
    }

    fn remove_file(&mut self, id: FileId) {
        if let Some(file) = self.files.remove(&id) {
            self.by_path.remove(&file.path);
        }
        self.usages.remove(&id);
        self.disk_locations.remove(&id);
    }
}

impl PersistenceGateway for MemoryStore {
    fn upsert_file(
        &self,
        observed: &ObservedFile,
        verified_at: DateTime<Utc>,
    ) -> StoreResult<FileUpsert> {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_path.get(&observed.path) {
            let record = inner
                .files
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("file", id))?;
            let content_changed = record.size != observed.size || record.modified != observed.modified;
            record.size = observed.size;
            record.inode = observed.inode;
            record.device_id = observed.device_id;
            record.modified = observed.modified;
            record.last_verified = verified_at;
            record.extension = extension_of(&observed.path);
            if content_changed {
                record.content_hash = None;
                record.hash_level = 0;
                record.hash_bytes = 0;
            }
            return Ok(FileUpsert {
                record: record.clone(),
                inserted: false,
            });
        }

        inner.next_file_id += 1;
        let id = FileId(inner.next_file_id);
        let record = FileRecord::from_observed(id, observed, verified_at);
        inner.by_path.insert(record.path.clone(), id);
        inner.files.insert(id, record.clone());
        Ok(FileUpsert {
            record,
            inserted: true,
        })
    }

    fn file(&self, id: FileId) -> StoreResult<Option<FileRecord>> {
        Ok(self.inner.read().files.get(&id).cloned())
    }

    fn file_by_path(&self, path: &Path) -> StoreResult<Option<FileRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .by_path
            .get(path)
            .and_then(|id| inner.files.get(id))
            .cloned())
    }

    fn touch_verified(&self, id: FileId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let record = inner
            .files
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("file", id))?;
        record.last_verified = at;
        Ok(())
    }

    fn delete_file(&self, id: FileId) -> StoreResult<()> {
        self.inner.write().remove_file(id);
        Ok(())
    }

    fn list_files(&self, query: &FileQuery) -> StoreResult<Vec<FileRecord>> {
        let inner = self.inner.read();
        let selected = inner.select(query);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(selected
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn count_files(&self, query: &FileQuery) -> StoreResult<u64> {
        let inner = self.inner.read();
        Ok(inner.select(query).len() as u64)
    }

    fn set_orphaned(&self, updates: &[(FileId, bool)]) -> StoreResult<()> {
        let mut inner = self.inner.write();
        for &(id, orphaned) in updates {
            if let Some(file) = inner.files.get_mut(&id) {
                file.is_orphaned = orphaned;
            }
        }
        Ok(())
    }

    fn set_content_hash(
        &self,
        id: FileId,
        hash: ContentHash,
        level: HashLevel,
        bytes: u64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let file = inner
            .files
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("file", id))?;
        file.content_hash = Some(hash);
        file.hash_level = level;
        file.hash_bytes = bytes;
        Ok(())
    }

    fn upsert_usage(&self, usage: &UsageRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if !inner.files.contains_key(&usage.file_id) {
            return Err(StoreError::not_found("file", usage.file_id));
        }
        inner
            .usages
            .entry(usage.file_id)
            .or_default()
            .insert(usage.service.clone(), usage.clone());
        Ok(())
    }

    fn usages_for_file(&self, id: FileId) -> StoreResult<Vec<UsageRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .usages
            .get(&id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn usages_for_service(&self, service: &ServiceId) -> StoreResult<Vec<UsageRecord>> {
        let inner = self.inner.read();
        let mut usages: Vec<UsageRecord> = inner
            .usages
            .values()
            .filter_map(|m| m.get(service).cloned())
            .collect();
        usages.sort_by_key(|u| u.file_id);
        Ok(usages)
    }

    fn usage_counts(&self, ids: &[FileId]) -> StoreResult<HashMap<FileId, u64>> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                inner
                    .usages
                    .get(id)
                    .filter(|m| !m.is_empty())
                    .map(|m| (*id, m.len() as u64))
            })
            .collect())
    }

    fn prune_usages(&self, service: &ServiceId, keep: &HashSet<FileId>) -> StoreResult<u64> {
        let mut inner = self.inner.write();
        let mut removed = 0;
        for (file_id, usages) in inner.usages.iter_mut() {
            if !keep.contains(file_id) && usages.remove(service).is_some() {
                removed += 1;
            }
        }
        inner.usages.retain(|_, m| !m.is_empty());
        Ok(removed)
    }

    fn create_scan(&self, new: NewScan) -> StoreResult<ScanRecord> {
        let mut inner = self.inner.write();
        if let Some(running) = inner.scans.values().find(|s| s.status == ScanStatus::Running) {
            return Err(StoreError::Conflict {
                message: format!("scan {} is already running", running.id),
            });
        }
        inner.next_scan_id += 1;
        let scan = ScanRecord::new(ScanId(inner.next_scan_id), new);
        inner.scans.insert(scan.id, scan.clone());
        Ok(scan)
    }

    fn update_scan(&self, scan: &ScanRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .scans
            .get_mut(&scan.id)
            .ok_or_else(|| StoreError::not_found("scan", scan.id))?;
        if stored.status.is_terminal() {
            return Err(StoreError::Conflict {
                message: format!("scan {} is already {}", scan.id, stored.status),
            });
        }
        *stored = scan.clone();
        Ok(())
    }

    fn scan(&self, id: ScanId) -> StoreResult<Option<ScanRecord>> {
        Ok(self.inner.read().scans.get(&id).cloned())
    }

    fn running_scan(&self) -> StoreResult<Option<ScanRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .scans
            .values()
            .rev()
            .find(|s| s.status == ScanStatus::Running)
            .cloned())
    }

    fn last_interrupted_scan(&self) -> StoreResult<Option<ScanRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .scans
            .values()
            .rev()
            .find(|s| s.status.is_resumable())
            .cloned())
    }

    fn recent_scans(&self, limit: usize) -> StoreResult<Vec<ScanRecord>> {
        let inner = self.inner.read();
        Ok(inner.scans.values().rev().take(limit).cloned().collect())
    }

    fn append_scan_log(&self, id: ScanId, line: &str) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let lines = inner.scan_logs.entry(id).or_default();
        if lines.len() >= MAX_SCAN_LOG_LINES {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
        Ok(())
    }

    fn scan_log(&self, id: ScanId) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .read()
            .scan_logs
            .get(&id)
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert_disk_location(&self, location: &FileDiskLocation) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if !inner.files.contains_key(&location.file_id) {
            return Err(StoreError::not_found("file", location.file_id));
        }
        inner
            .disk_locations
            .entry(location.file_id)
            .or_default()
            .insert(location.disk_device_id, location.clone());
        Ok(())
    }

    fn disk_locations(&self, file: FileId) -> StoreResult<Vec<FileDiskLocation>> {
        let inner = self.inner.read();
        Ok(inner
            .disk_locations
            .get(&file)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_disk_locations(&self, file: FileId) -> StoreResult<()> {
        self.inner.write().disk_locations.remove(&file);
        Ok(())
    }

    fn clear_service_missing(&self) -> StoreResult<()> {
        self.inner.write().missing.clear();
        Ok(())
    }

    fn record_service_missing(&self, entries: &[ServiceMissingEntry]) -> StoreResult<()> {
        self.inner.write().missing.extend_from_slice(entries);
        Ok(())
    }

    fn service_missing(
        &self,
        service: Option<&ServiceId>,
    ) -> StoreResult<Vec<ServiceMissingEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .missing
            .iter()
            .filter(|e| service.is_none_or(|s| &e.service == s))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanType;

    fn observed(path: &str, size: u64, inode: u64) -> ObservedFile {
        ObservedFile {
            path: PathBuf::from(path),
            size,
            inode,
            device_id: 1,
            modified: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_upsert_is_keyed_by_path() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store.upsert_file(&observed("/m/a.mkv", 10, 1), now).unwrap();
        assert!(first.inserted);
        let second = store.upsert_file(&observed("/m/a.mkv", 20, 1), now).unwrap();
        assert!(!second.inserted);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(store.count_files(&FileQuery::all()).unwrap(), 1);
        assert_eq!(second.record.size, 20);
    }

    #[test]
    fn test_content_change_clears_hash() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.upsert_file(&observed("/m/a.mkv", 10, 1), now).unwrap().record.id;
        store.set_content_hash(id, ContentHash::new([1; 32]), 2, 10).unwrap();

        let same = store.upsert_file(&observed("/m/a.mkv", 10, 1), now).unwrap();
        assert_eq!(same.record.hash_level, 2);
        assert_eq!(same.record.hash_bytes, 10);

        let changed = store.upsert_file(&observed("/m/a.mkv", 11, 1), now).unwrap();
        assert_eq!(changed.record.hash_level, 0);
        assert_eq!(changed.record.hash_bytes, 0);
        assert!(changed.record.content_hash.is_none());
    }

    #[test]
    fn test_delete_cascades() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.upsert_file(&observed("/m/a.mkv", 10, 1), now).unwrap().record.id;
        store
            .upsert_usage(&UsageRecord {
                file_id: id,
                service: "radarr".into(),
                reference_path: "/movies/a.mkv".into(),
                metadata: None,
            })
            .unwrap();
        store
            .upsert_disk_location(&FileDiskLocation {
                file_id: id,
                disk_device_id: 7,
                disk_path: PathBuf::from("/mnt/disk1/a.mkv"),
            })
            .unwrap();

        store.delete_file(id).unwrap();
        assert!(store.usages_for_file(id).unwrap().is_empty());
        assert!(store.disk_locations(id).unwrap().is_empty());
        assert!(store.file_by_path(Path::new("/m/a.mkv")).unwrap().is_none());
    }

    #[test]
    fn test_query_filters_and_paging() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_file(&observed("/m/c.mkv", 30, 3), now).unwrap();
        store.upsert_file(&observed("/m/a.mkv", 10, 1), now).unwrap();
        store.upsert_file(&observed("/m/b.mkv", 20, 1), now).unwrap();

        let paths: Vec<_> = store
            .list_files(&FileQuery::all().page(1, 1))
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec![PathBuf::from("/m/b.mkv")]);

        let largest = store
            .list_files(&FileQuery::all().sorted_by(SortField::Size, SortOrder::Descending))
            .unwrap();
        assert_eq!(largest[0].size, 30);

        let linked = store.list_files(&FileQuery::all().hardlinked_only()).unwrap();
        assert_eq!(linked.len(), 2);

        assert_eq!(store.count_files(&FileQuery::all().min_size(15)).unwrap(), 2);
    }

    #[test]
    fn test_prune_usages_keeps_reported() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.upsert_file(&observed("/m/a.mkv", 10, 1), now).unwrap().record.id;
        let b = store.upsert_file(&observed("/m/b.mkv", 10, 2), now).unwrap().record.id;
        for id in [a, b] {
            store
                .upsert_usage(&UsageRecord {
                    file_id: id,
                    service: "sonarr".into(),
                    reference_path: String::new(),
                    metadata: None,
                })
                .unwrap();
        }
        let keep: HashSet<FileId> = [a].into_iter().collect();
        assert_eq!(store.prune_usages(&"sonarr".into(), &keep).unwrap(), 1);
        assert_eq!(store.usage_counts(&[a, b]).unwrap().len(), 1);
    }

    #[test]
    fn test_single_running_scan_and_terminal_immutability() {
        let store = MemoryStore::new();
        let new = || NewScan {
            scan_type: ScanType::Full,
            resume_from: None,
            started_at: Utc::now(),
        };
        let mut scan = store.create_scan(new()).unwrap();
        assert!(matches!(store.create_scan(new()), Err(StoreError::Conflict { .. })));

        scan.finish(ScanStatus::Interrupted, Utc::now());
        store.update_scan(&scan).unwrap();
        assert!(store.update_scan(&scan).is_err());
        assert_eq!(store.last_interrupted_scan().unwrap().unwrap().id, scan.id);
        assert!(store.running_scan().unwrap().is_none());
    }

    #[test]
    fn test_scan_log_keeps_newest_lines() {
        let store = MemoryStore::new();
        let id = ScanId(1);
        for n in 0..MAX_SCAN_LOG_LINES + 5 {
            store.append_scan_log(id, &format!("line {n}")).unwrap();
        }
        let log = store.scan_log(id).unwrap();
        assert_eq!(log.len(), MAX_SCAN_LOG_LINES);
        assert_eq!(log[0], "line 5");
        assert_eq!(log[log.len() - 1], format!("line {}", MAX_SCAN_LOG_LINES + 4));
        assert!(store.scan_log(ScanId(2)).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store.upsert_file(&observed("/m/a.mkv", 10, 1), now).unwrap().record.id;
        store
            .upsert_usage(&UsageRecord {
                file_id: id,
                service: "plex".into(),
                reference_path: "/data/a.mkv".into(),
                metadata: None,
            })
            .unwrap();
        store.append_scan_log(ScanId(3), "Scanning filesystem").unwrap();
        store.save(&path).unwrap();

        let loaded = MemoryStore::open(&path).unwrap();
        assert_eq!(loaded.scan_log(ScanId(3)).unwrap(), vec!["Scanning filesystem"]);
        assert_eq!(loaded.file_by_path(Path::new("/m/a.mkv")).unwrap().unwrap().id, id);
        assert_eq!(loaded.usages_for_file(id).unwrap().len(), 1);
        let next = loaded.upsert_file(&observed("/m/b.mkv", 1, 2), now).unwrap();
        assert!(next.record.id > id);
    }
}

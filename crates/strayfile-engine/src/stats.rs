//! Cached library statistics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use strayfile_analyze::HardlinkGrouper;
use strayfile_core::{FileQuery, PersistenceGateway, ServiceId, StoreResult};

/// Aggregate view of the stored library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub total_files: u64,
    pub total_bytes: u64,
    pub orphaned_files: u64,
    pub orphaned_bytes: u64,
    pub hardlink_groups: u64,
    /// Bytes saved by hardlinks compared to independent copies.
    pub hardlink_savings: u64,
    /// Files referenced per service.
    pub usage_by_service: BTreeMap<ServiceId, u64>,
    /// Files found by the most recent passes but unknown to the store.
    pub missing_entries: u64,
    pub computed_at: DateTime<Utc>,
}

impl LibraryStats {
    /// Walk the store once and aggregate.
    pub fn compute(
        store: &dyn PersistenceGateway,
        services: &[ServiceId],
        batch: usize,
    ) -> StoreResult<Self> {
        let batch = batch.max(1);
        let mut stats = Self {
            total_files: 0,
            total_bytes: 0,
            orphaned_files: 0,
            orphaned_bytes: 0,
            hardlink_groups: 0,
            hardlink_savings: 0,
            usage_by_service: BTreeMap::new(),
            missing_entries: 0,
            computed_at: Utc::now(),
        };

        let mut offset = 0;
        loop {
            let page = store.list_files(&FileQuery::all().page(offset, batch))?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for file in &page {
                stats.total_files += 1;
                stats.total_bytes += file.size;
                if file.is_orphaned {
                    stats.orphaned_files += 1;
                    stats.orphaned_bytes += file.size;
                }
            }
        }

        let linked = store.list_files(&FileQuery::all().hardlinked_only())?;
        let hardlinks = HardlinkGrouper::new().group(&linked);
        stats.hardlink_groups = hardlinks.groups.len() as u64;
        stats.hardlink_savings = hardlinks.total_space_saved;

        for service in services {
            let count = store.count_files(&FileQuery::all().service(service.clone()))?;
            stats.usage_by_service.insert(service.clone(), count);
        }
        stats.missing_entries = store.service_missing(None)?.len() as u64;

        Ok(stats)
    }
}

/// Memoizes [`LibraryStats`] for a fixed time-to-live.
#[derive(Debug)]
pub struct StatsCache {
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<LibraryStats>)>>,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Replace the cached value.
    pub fn insert(&self, stats: LibraryStats) -> Arc<LibraryStats> {
        let stats = Arc::new(stats);
        *self.cached.lock() = Some((Instant::now(), Arc::clone(&stats)));
        stats
    }

    /// The cached value, if younger than the TTL.
    pub fn fresh(&self) -> Option<Arc<LibraryStats>> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, stats)| Arc::clone(stats))
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use strayfile_core::{MemoryStore, ObservedFile, UsageRecord};

    fn observed(path: &str, size: u64, inode: u64) -> ObservedFile {
        ObservedFile {
            path: PathBuf::from(path),
            size,
            inode,
            device_id: 1,
            modified: Utc::now(),
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.upsert_file(&observed("/m/a.mkv", 100, 1), now).unwrap().record;
        let b = store.upsert_file(&observed("/m/b.mkv", 40, 2), now).unwrap().record;
        store.upsert_file(&observed("/m/c.mkv", 40, 2), now).unwrap();
        store
            .upsert_usage(&UsageRecord {
                file_id: a.id,
                service: "radarr".into(),
                reference_path: "/movies/a.mkv".into(),
                metadata: None,
            })
            .unwrap();
        store.set_orphaned(&[(b.id, true)]).unwrap();
        store
    }

    #[test]
    fn test_compute() {
        let store = seeded();
        let stats = LibraryStats::compute(&store, &["radarr".into(), "sonarr".into()], 2).unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.total_bytes, 180);
        assert_eq!(stats.orphaned_files, 1);
        assert_eq!(stats.orphaned_bytes, 40);
        assert_eq!(stats.hardlink_groups, 1);
        assert_eq!(stats.hardlink_savings, 40);
        assert_eq!(stats.usage_by_service[&ServiceId::from("radarr")], 1);
        assert_eq!(stats.usage_by_service[&ServiceId::from("sonarr")], 0);
    }

    #[test]
    fn test_cache_ttl_and_invalidate() {
        let store = seeded();
        let cache = StatsCache::new(Duration::from_secs(60));
        assert!(cache.fresh().is_none());

        let inserted = cache.insert(LibraryStats::compute(&store, &[], 10).unwrap());
        let cached = cache.fresh().unwrap();
        assert!(Arc::ptr_eq(&inserted, &cached));

        cache.invalidate();
        assert!(cache.fresh().is_none());
    }

    #[test]
    fn test_zero_ttl_never_caches() {
        let store = seeded();
        let cache = StatsCache::new(Duration::ZERO);
        cache.insert(LibraryStats::compute(&store, &[], 10).unwrap());
        assert!(cache.fresh().is_none());
    }
}

//! Duplicate file detection using progressive content hashing.
//!
//! Candidates are narrowed in rounds:
//! 1. Group files by exact size (no I/O)
//! 2. Hash the first `N_1` bytes of every member of a size group
//! 3. Members whose level-k hashes collide are hashed at level k+1, until the
//!    level covers the whole file
//!
//! A file whose prefix hash differs from all its size peers is never read
//! further. Hardlinked files remain candidates; identity and content are
//! independent views.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use blake3::Hasher;
use derive_builder::Builder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strayfile_core::{
    ContentHash, EngineConfig, FileDiskLocation, FileId, FileRecord, HashLevel, HashLevels,
    ScanWarning, WarningKind,
};

/// Files larger than this are hashed through a memory map when hashed whole.
const MMAP_THRESHOLD: u64 = 128 * 1024;

/// Configuration for duplicate detection.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct DuplicateConfig {
    /// Progressive prefix sizes.
    #[builder(default)]
    pub levels: HashLevels,

    /// Minimum file size to consider.
    #[builder(default = "1")]
    pub min_size: u64,

    /// Maximum file size to consider.
    #[builder(default = "u64::MAX")]
    pub max_size: u64,

    /// Maximum number of groups to return (0 = unlimited).
    #[builder(default = "0")]
    pub max_groups: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            levels: HashLevels::default(),
            min_size: 1,
            max_size: u64::MAX,
            max_groups: 0,
        }
    }
}

impl DuplicateConfig {
    /// Create a new config builder.
    pub fn builder() -> DuplicateConfigBuilder {
        DuplicateConfigBuilder::default()
    }

    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            levels: config.hash_levels.clone(),
            min_size: config.min_duplicate_size,
            ..Self::default()
        }
    }
}

/// Where the copies of a duplicate group physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskClass {
    /// At least two copies share a physical disk.
    SameDisk,
    /// Every copy sits on a different disk.
    CrossDisk,
    /// Some member has no recorded disk location.
    #[default]
    Unknown,
}

/// One file in a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateFile {
    pub id: FileId,
    pub path: PathBuf,
}

/// A group of files sharing the same content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Full-content hash shared by all files in this group.
    pub hash: ContentHash,

    /// Size of each file in bytes.
    pub size: u64,

    pub files: Vec<DuplicateFile>,

    /// Wasted space: size * (count - 1).
    pub wasted_bytes: u64,

    pub disk_class: DiskClass,
}

impl DuplicateGroup {
    /// Get the number of duplicate files.
    pub fn count(&self) -> usize {
        self.files.len()
    }

    /// Check if keeping one file, how many could be deleted.
    pub fn deletable_count(&self) -> usize {
        self.files.len().saturating_sub(1)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }
}

/// Hash reached by one file during detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashedFile {
    pub id: FileId,
    pub hash: ContentHash,
    pub level: HashLevel,
    /// Leading bytes the hash covers.
    pub bytes: u64,
}

/// Results from duplicate analysis.
#[derive(Debug, Clone, Default)]
pub struct DuplicateReport {
    /// Groups of duplicate files, sorted by wasted space descending.
    pub groups: Vec<DuplicateGroup>,

    /// Total wasted space (could be reclaimed).
    pub total_wasted_space: u64,

    /// Number of files analyzed.
    pub files_analyzed: u64,

    /// Hashes computed per level; index 0 is level 1.
    pub hashes_per_level: Vec<u64>,

    /// Hashes taken from stored records instead of being recomputed.
    pub hashes_reused: u64,

    pub bytes_hashed: u64,

    /// Highest hash reached per file, for persisting.
    pub hashed: Vec<HashedFile>,

    pub warnings: Vec<ScanWarning>,

    /// Detection was abandoned early; groups and hashes cover finished work only.
    pub stopped: bool,
}

impl DuplicateReport {
    /// Check if any duplicates were found.
    pub fn has_duplicates(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Get total number of duplicate files across all groups.
    pub fn total_duplicate_files(&self) -> usize {
        self.groups.iter().map(|g| g.files.len()).sum()
    }

    /// Classify every group by physical disk.
    ///
    /// A group with any member lacking disk locations is left `Unknown` and is
    /// listed by [`groups_missing_locations`](Self::groups_missing_locations).
    pub fn classify_disks(&mut self, locations: &HashMap<FileId, Vec<FileDiskLocation>>) {
        for group in &mut self.groups {
            group.disk_class = classify(group, locations);
        }
    }

    /// Groups skipped for same-disk classification.
    pub fn groups_missing_locations(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups
            .iter()
            .filter(|g| g.disk_class == DiskClass::Unknown)
    }

    pub fn same_disk_groups(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups
            .iter()
            .filter(|g| g.disk_class == DiskClass::SameDisk)
    }
}

fn classify(group: &DuplicateGroup, locations: &HashMap<FileId, Vec<FileDiskLocation>>) -> DiskClass {
    let mut disks_seen: HashMap<u64, usize> = HashMap::new();
    for file in &group.files {
        let Some(found) = locations.get(&file.id).filter(|l| !l.is_empty()) else {
            return DiskClass::Unknown;
        };
        let mut own: Vec<u64> = found.iter().map(|l| l.disk_device_id).collect();
        own.sort_unstable();
        own.dedup();
        for disk in own {
            *disks_seen.entry(disk).or_default() += 1;
        }
    }
    if disks_seen.values().any(|&n| n > 1) {
        DiskClass::SameDisk
    } else {
        DiskClass::CrossDisk
    }
}

/// Progress information during duplicate detection.
#[derive(Debug, Clone)]
pub struct HashProgress {
    /// Size groups finished so far.
    pub groups_processed: u64,
    /// Size groups with more than one member.
    pub total_groups: u64,
    /// Bytes hashed so far.
    pub bytes_hashed: u64,
}

/// Hooks a detection run reports to and polls, called from rayon workers.
pub trait HashObserver: Sync {
    /// Called after each size group finishes.
    fn progress(&self, _progress: &HashProgress) {}

    /// Hashes reached by the members of one size group, once it finished or
    /// was abandoned.
    fn hashed(&self, _files: &[HashedFile]) {}

    /// Polled before each size group and each file; `true` abandons the
    /// remaining work.
    fn should_stop(&self) -> bool {
        false
    }
}

struct Unobserved;

impl HashObserver for Unobserved {}

/// Progressive-hash duplicate detector.
pub struct DuplicateDetector {
    config: DuplicateConfig,
}

struct Candidate<'a> {
    record: &'a FileRecord,
    hash: Option<ContentHash>,
}

#[derive(Default)]
struct SizeGroupOutcome {
    groups: Vec<DuplicateGroup>,
    hashed: HashMap<FileId, HashedFile>,
    hashes_per_level: Vec<u64>,
    reused: u64,
    bytes_hashed: u64,
    warnings: Vec<ScanWarning>,
    stopped: bool,
}

impl DuplicateDetector {
    /// Create a new detector with default config.
    pub fn new() -> Self {
        Self {
            config: DuplicateConfig::default(),
        }
    }

    pub fn with_config(config: DuplicateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DuplicateConfig {
        &self.config
    }

    /// Find duplicates among stored file records.
    pub fn find_duplicates(&self, files: &[FileRecord]) -> DuplicateReport {
        self.find_duplicates_observed(files, &Unobserved)
    }

    /// Find duplicates, handing each size group's hashes and progress to
    /// `observer` and stopping when it asks to.
    pub fn find_duplicates_observed(&self, files: &[FileRecord], observer: &dyn HashObserver) -> DuplicateReport {
        let eligible: Vec<&FileRecord> = files
            .iter()
            .filter(|f| f.size >= self.config.min_size && f.size <= self.config.max_size)
            .collect();
        let files_analyzed = eligible.len() as u64;

        let size_groups = group_by_size(eligible);
        let total_groups = size_groups.len() as u64;
        debug!(files = files_analyzed, size_groups = total_groups, "hashing size groups");

        let processed = AtomicU64::new(0);
        let bytes = AtomicU64::new(0);
        let outcomes: Vec<SizeGroupOutcome> = size_groups
            .into_par_iter()
            .map(|(size, members)| {
                if observer.should_stop() {
                    return SizeGroupOutcome {
                        stopped: true,
                        ..SizeGroupOutcome::default()
                    };
                }
                let outcome = self.resolve_size_group(size, members, observer);
                if !outcome.hashed.is_empty() {
                    let hashed: Vec<HashedFile> = outcome.hashed.values().copied().collect();
                    observer.hashed(&hashed);
                }
                let bytes_hashed = bytes.fetch_add(outcome.bytes_hashed, Ordering::Relaxed) + outcome.bytes_hashed;
                let groups_processed = processed.fetch_add(1, Ordering::Relaxed) + 1;
                observer.progress(&HashProgress {
                    groups_processed,
                    total_groups,
                    bytes_hashed,
                });
                outcome
            })
            .collect();

        let mut report = DuplicateReport {
            files_analyzed,
            hashes_per_level: vec![0; self.config.levels.full_level() as usize],
            ..DuplicateReport::default()
        };
        for outcome in outcomes {
            report.groups.extend(outcome.groups);
            report.hashed.extend(outcome.hashed.into_values());
            for (i, n) in outcome.hashes_per_level.into_iter().enumerate() {
                if let Some(slot) = report.hashes_per_level.get_mut(i) {
                    *slot += n;
                }
            }
            report.hashes_reused += outcome.reused;
            report.bytes_hashed += outcome.bytes_hashed;
            report.warnings.extend(outcome.warnings);
            report.stopped |= outcome.stopped;
        }
        if report.stopped {
            debug!(groups = report.groups.len(), "hashing stopped early");
        }

        // Sort by wasted space descending, path as tie-break for stable output
        report.groups.sort_by(|a, b| {
            b.wasted_bytes
                .cmp(&a.wasted_bytes)
                .then_with(|| a.files[0].path.cmp(&b.files[0].path))
        });
        if self.config.max_groups > 0 && report.groups.len() > self.config.max_groups {
            report.groups.truncate(self.config.max_groups);
        }
        report.total_wasted_space = report.groups.iter().map(|g| g.wasted_bytes).sum();
        report.hashed.sort_by_key(|h| h.id);
        report
    }

    fn resolve_size_group(&self, size: u64, members: Vec<&FileRecord>, observer: &dyn HashObserver) -> SizeGroupOutcome {
        let mut outcome = SizeGroupOutcome {
            hashes_per_level: vec![0; self.config.levels.full_level() as usize],
            ..SizeGroupOutcome::default()
        };
        let candidates = members
            .into_iter()
            .map(|record| Candidate { record, hash: None })
            .collect();
        self.escalate(size, 1, candidates, &mut outcome, observer);
        outcome
    }

    /// Hash `candidates` at `level` and recurse into colliding buckets.
    ///
    /// A level left incomplete by a stop request is not bucketed: partial
    /// buckets prove nothing.
    fn escalate(
        &self,
        size: u64,
        level: HashLevel,
        candidates: Vec<Candidate<'_>>,
        outcome: &mut SizeGroupOutcome,
        observer: &dyn HashObserver,
    ) {
        let levels = &self.config.levels;
        let byte_count = levels.bytes_for(level, size);

        type Hashed = Option<Result<(ContentHash, bool), ScanWarning>>;
        let hashed: Vec<(Candidate<'_>, Hashed)> = candidates
            .into_par_iter()
            .map(|candidate| {
                if observer.should_stop() {
                    return (candidate, None);
                }
                let result = self.hash_at(candidate.record, byte_count);
                (candidate, Some(result))
            })
            .collect();

        let mut buckets: HashMap<ContentHash, Vec<Candidate<'_>>> = HashMap::new();
        for (mut candidate, result) in hashed {
            match result {
                None => outcome.stopped = true,
                Some(Ok((hash, reused))) => {
                    if reused {
                        outcome.reused += 1;
                    } else {
                        if let Some(slot) = outcome.hashes_per_level.get_mut(level as usize - 1) {
                            *slot += 1;
                        }
                        outcome.bytes_hashed += byte_count;
                    }
                    candidate.hash = Some(hash);
                    let stored_level = if levels.covers_file(level, size) {
                        levels.full_level()
                    } else {
                        level
                    };
                    outcome.hashed.insert(
                        candidate.record.id,
                        HashedFile {
                            id: candidate.record.id,
                            hash,
                            level: stored_level,
                            bytes: byte_count,
                        },
                    );
                    buckets.entry(hash).or_default().push(candidate);
                }
                Some(Err(warning)) => {
                    warn!(path = %warning.path.display(), "{}", warning.message);
                    outcome.warnings.push(warning);
                }
            }
        }
        if outcome.stopped {
            return;
        }

        for (hash, bucket) in buckets {
            if bucket.len() < 2 {
                continue;
            }
            if levels.covers_file(level, size) {
                let mut files: Vec<DuplicateFile> = bucket
                    .iter()
                    .map(|c| DuplicateFile {
                        id: c.record.id,
                        path: c.record.path.clone(),
                    })
                    .collect();
                files.sort_by(|a, b| a.path.cmp(&b.path));
                let wasted_bytes = size * (files.len() as u64 - 1);
                outcome.groups.push(DuplicateGroup {
                    hash,
                    size,
                    files,
                    wasted_bytes,
                    disk_class: DiskClass::Unknown,
                });
            } else {
                self.escalate(size, level + 1, bucket, outcome, observer);
            }
        }
    }

    /// Hash the first `byte_count` bytes of a record, reusing a stored hash
    /// over exactly those bytes.
    fn hash_at(&self, record: &FileRecord, byte_count: u64) -> Result<(ContentHash, bool), ScanWarning> {
        if record.is_hashed() && record.hash_bytes == byte_count {
            if let Some(stored) = record.content_hash {
                return Ok((stored, true));
            }
        }
        let whole = byte_count >= record.size;
        hash_file(&record.path, byte_count, whole)
            .map(|hash| (hash, false))
            .map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    ScanWarning::new(
                        &record.path,
                        format!("{}: file shorter than recorded size", record.path.display()),
                        WarningKind::SizeMismatch,
                    )
                } else {
                    ScanWarning::from_io(&record.path, &err, WarningKind::HashError)
                }
            })
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Group files by size, keeping only sizes shared by two or more files.
fn group_by_size(files: Vec<&FileRecord>) -> Vec<(u64, Vec<&FileRecord>)> {
    let mut groups: HashMap<u64, Vec<&FileRecord>> = HashMap::new();
    for file in files {
        groups.entry(file.size).or_default().push(file);
    }
    let mut groups: Vec<(u64, Vec<&FileRecord>)> = groups.into_iter().filter(|(_, v)| v.len() > 1).collect();
    groups.sort_by_key(|(size, _)| std::cmp::Reverse(*size));
    groups
}

/// BLAKE3 of the first `bytes` bytes of `path`.
pub fn hash_file(path: &Path, bytes: u64, whole: bool) -> io::Result<ContentHash> {
    let mut hasher = Hasher::new();
    if whole && bytes > MMAP_THRESHOLD {
        hasher.update_mmap_rayon(path)?;
        return Ok(ContentHash::new(*hasher.finalize().as_bytes()));
    }

    let file = File::open(path)?;
    let copied = io::copy(&mut file.take(bytes), &mut hasher)?;
    if copied < bytes {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(ContentHash::new(*hasher.finalize().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use strayfile_core::ObservedFile;
    use tempfile::TempDir;

    fn record(id: u64, path: PathBuf) -> FileRecord {
        let size = fs::metadata(&path).unwrap().len();
        let observed = ObservedFile {
            path,
            size,
            inode: id,
            device_id: 1,
            modified: Utc::now(),
        };
        FileRecord::from_observed(FileId(id), &observed, Utc::now())
    }

    #[test]
    fn test_hash_prefix_and_whole() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, "same prefix, tail one").unwrap();
        fs::write(&b, "same prefix, tail two").unwrap();

        assert_eq!(hash_file(&a, 11, false).unwrap(), hash_file(&b, 11, false).unwrap());
        assert_ne!(hash_file(&a, 21, true).unwrap(), hash_file(&b, 21, true).unwrap());
    }

    #[test]
    fn test_short_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        fs::write(&a, "tiny").unwrap();
        let err = hash_file(&a, 100, true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_first_level_divergence_stops_escalation() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, "AAAA-identical-tail").unwrap();
        fs::write(&b, "BBBB-identical-tail").unwrap();

        let config = DuplicateConfig::builder()
            .levels(HashLevels::new(vec![4, 8]))
            .build()
            .unwrap();
        let detector = DuplicateDetector::with_config(config);
        let report = detector.find_duplicates(&[record(1, a), record(2, b)]);

        assert!(!report.has_duplicates());
        assert_eq!(report.hashes_per_level, vec![2, 0, 0]);
    }

    #[test]
    fn test_reuses_stored_hash() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, "abc").unwrap();
        fs::write(&b, "abc").unwrap();

        let detector = DuplicateDetector::new();
        let mut first = record(1, a);
        let second = record(2, b);
        let report = detector.find_duplicates(&[first.clone(), second.clone()]);
        let stored = report.hashed.iter().find(|h| h.id == first.id).unwrap();
        first.content_hash = Some(stored.hash);
        first.hash_level = stored.level;
        first.hash_bytes = stored.bytes;

        let again = detector.find_duplicates(&[first, second]);
        assert_eq!(again.hashes_reused, 1);
        assert_eq!(again.group_count(), 1);
    }

    #[test]
    fn test_stored_hash_over_other_bytes_is_not_reused() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, "abcdefghij").unwrap();
        fs::write(&b, "abcdefghij").unwrap();

        // hashed at level 1 while the first prefix was 4 bytes
        let mut first = record(1, a.clone());
        first.content_hash = Some(hash_file(&a, 4, false).unwrap());
        first.hash_level = 1;
        first.hash_bytes = 4;

        let config = DuplicateConfig::builder()
            .levels(HashLevels::new(vec![2]))
            .build()
            .unwrap();
        let report = DuplicateDetector::with_config(config).find_duplicates(&[first, record(2, b)]);

        assert_eq!(report.hashes_reused, 0);
        assert_eq!(report.group_count(), 1);
        let upgraded = report.hashed.iter().find(|h| h.id == FileId(1)).unwrap();
        assert_eq!(upgraded.bytes, 10);
        assert_eq!(upgraded.level, 2);
    }
}

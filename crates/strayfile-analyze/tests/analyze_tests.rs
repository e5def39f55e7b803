use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use strayfile_analyze::{
    DiskClass, DuplicateConfig, DuplicateDetector, HardlinkGrouper, HashLevels, HashObserver,
    HashProgress, HashedFile,
};
use strayfile_core::{FileDiskLocation, FileId, FileRecord, ObservedFile};
use tempfile::TempDir;

fn record_for(id: u64, path: &Path) -> FileRecord {
    let meta = fs::metadata(path).unwrap();
    let observed = ObservedFile {
        path: path.to_path_buf(),
        size: meta.len(),
        inode: id,
        device_id: 1,
        modified: Utc::now(),
    };
    FileRecord::from_observed(FileId(id), &observed, Utc::now())
}

fn records(paths: &[PathBuf]) -> Vec<FileRecord> {
    paths
        .iter()
        .enumerate()
        .map(|(i, p)| record_for(i as u64 + 1, p))
        .collect()
}

#[derive(Default)]
struct Recorder {
    hashed: Mutex<Vec<FileId>>,
    progress_calls: AtomicU64,
    stop: AtomicBool,
}

impl HashObserver for Recorder {
    fn progress(&self, _progress: &HashProgress) {
        self.progress_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn hashed(&self, files: &[HashedFile]) {
        self.hashed.lock().unwrap().extend(files.iter().map(|h| h.id));
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

fn small_levels() -> DuplicateConfig {
    DuplicateConfig::builder()
        .levels(HashLevels::new(vec![4, 16]))
        .build()
        .unwrap()
}

#[test]
fn test_duplicate_config_builder() {
    let config = DuplicateConfig::builder()
        .min_size(2048u64)
        .max_size(10 * 1024 * 1024u64)
        .max_groups(5usize)
        .build()
        .unwrap();

    assert_eq!(config.min_size, 2048);
    assert_eq!(config.max_size, 10 * 1024 * 1024);
    assert_eq!(config.max_groups, 5);
    assert_eq!(config.levels, HashLevels::default());

    let default_config = DuplicateConfig::default();
    assert_eq!(default_config.min_size, 1);
}

#[test]
fn test_find_duplicates_with_no_files() {
    let report = DuplicateDetector::new().find_duplicates(&[]);
    assert_eq!(report.files_analyzed, 0);
    assert!(!report.has_duplicates());
}

#[test]
fn test_find_duplicates_with_no_actual_duplicates() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();

    fs::write(root.join("file1.txt"), "content one").unwrap();
    fs::write(root.join("file2.txt"), "content two").unwrap();
    fs::write(root.join("file3.txt"), "content three").unwrap();

    let files = records(&[root.join("file1.txt"), root.join("file2.txt"), root.join("file3.txt")]);
    let report = DuplicateDetector::new().find_duplicates(&files);

    assert_eq!(report.files_analyzed, 3);
    assert!(!report.has_duplicates());
}

#[test]
fn test_find_duplicates_escalates_to_full_content() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();

    // 40 bytes each: level 1 = 4 bytes, level 2 = 16 bytes, level 3 = whole file
    let content = "This is duplicate content, forty bytes!!";
    let near = "This is duplicate content, forty bytes??";
    fs::write(root.join("file1.txt"), content).unwrap();
    fs::write(root.join("file2.txt"), content).unwrap();
    fs::write(root.join("file3.txt"), content).unwrap();
    fs::write(root.join("file4.txt"), near).unwrap();

    let files = records(&[
        root.join("file1.txt"),
        root.join("file2.txt"),
        root.join("file3.txt"),
        root.join("file4.txt"),
    ]);
    let report = DuplicateDetector::with_config(small_levels()).find_duplicates(&files);

    assert_eq!(report.group_count(), 1);
    assert_eq!(report.total_duplicate_files(), 3);
    assert_eq!(report.total_wasted_space, content.len() as u64 * 2);
    assert_eq!(report.hashes_per_level, vec![4, 4, 4]);

    // every file reached the full level
    assert!(report.hashed.iter().all(|h| h.level == 3));
}

#[test]
fn test_different_sizes_are_never_hashed() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::write(root.join("a"), "short").unwrap();
    fs::write(root.join("b"), "a bit longer").unwrap();

    let files = records(&[root.join("a"), root.join("b")]);
    let report = DuplicateDetector::new().find_duplicates(&files);
    assert_eq!(report.bytes_hashed, 0);
    assert!(report.hashed.is_empty());
}

#[test]
fn test_missing_file_becomes_warning() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::write(root.join("a"), "same").unwrap();
    fs::write(root.join("b"), "same").unwrap();
    fs::write(root.join("c"), "same").unwrap();

    let files = records(&[root.join("a"), root.join("b"), root.join("c")]);
    fs::remove_file(root.join("c")).unwrap();

    let report = DuplicateDetector::new().find_duplicates(&files);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.group_count(), 1);
    assert_eq!(report.groups[0].count(), 2);
}

#[test]
fn test_disk_classification() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::write(root.join("a"), "pair").unwrap();
    fs::write(root.join("b"), "pair").unwrap();
    fs::write(root.join("e"), "trio").unwrap();
    fs::write(root.join("f"), "trio").unwrap();

    let mut files = records(&[root.join("a"), root.join("b")]);
    files.push(record_for(3, &root.join("e")));
    files.push(record_for(4, &root.join("f")));
    let mut report = DuplicateDetector::new().find_duplicates(&files);
    assert_eq!(report.group_count(), 2);

    let location = |id: u64, disk: u64| FileDiskLocation {
        file_id: FileId(id),
        disk_device_id: disk,
        disk_path: PathBuf::from(format!("/mnt/disk{disk}/x")),
    };
    let mut locations = HashMap::new();
    locations.insert(FileId(1), vec![location(1, 1)]);
    locations.insert(FileId(2), vec![location(2, 1)]);
    locations.insert(FileId(3), vec![location(3, 2)]);
    // file 4 has no location

    report.classify_disks(&locations);
    let same: Vec<_> = report.same_disk_groups().collect();
    assert_eq!(same.len(), 1);
    assert!(same[0].files.iter().any(|f| f.id == FileId(1)));

    let skipped: Vec<_> = report.groups_missing_locations().collect();
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0].files.iter().any(|f| f.id == FileId(4)));
    assert_eq!(skipped[0].disk_class, DiskClass::Unknown);
}

#[test]
fn test_hardlinks_remain_duplicate_candidates() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::write(root.join("a"), "linked").unwrap();
    fs::hard_link(root.join("a"), root.join("b")).unwrap();

    let mut files = records(&[root.join("a"), root.join("b")]);
    for f in &mut files {
        f.inode = 99;
    }

    let hardlinks = HardlinkGrouper::new().group(&files);
    assert_eq!(hardlinks.total_space_saved, 6);

    let duplicates = DuplicateDetector::new().find_duplicates(&files);
    assert_eq!(duplicates.group_count(), 1);
}

#[test]
fn test_observer_receives_each_size_group() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::write(root.join("a"), "pair").unwrap();
    fs::write(root.join("b"), "pair").unwrap();
    fs::write(root.join("c"), "longer pair").unwrap();
    fs::write(root.join("d"), "longer pair").unwrap();
    fs::write(root.join("e"), "unique size file").unwrap();

    let files = records(&[root.join("a"), root.join("b"), root.join("c"), root.join("d"), root.join("e")]);
    let recorder = Recorder::default();
    let report = DuplicateDetector::with_config(small_levels()).find_duplicates_observed(&files, &recorder);

    assert!(!report.stopped);
    assert_eq!(report.group_count(), 2);
    assert_eq!(recorder.progress_calls.load(Ordering::Relaxed), 2);

    let mut seen = recorder.hashed.into_inner().unwrap();
    seen.sort();
    let reported: Vec<FileId> = report.hashed.iter().map(|h| h.id).collect();
    assert_eq!(seen, reported);
    assert_eq!(seen, vec![FileId(1), FileId(2), FileId(3), FileId(4)]);
}

#[test]
fn test_stop_request_abandons_hashing() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::write(root.join("a"), "same content").unwrap();
    fs::write(root.join("b"), "same content").unwrap();

    let files = records(&[root.join("a"), root.join("b")]);
    let recorder = Recorder::default();
    recorder.stop.store(true, Ordering::Relaxed);
    let report = DuplicateDetector::new().find_duplicates_observed(&files, &recorder);

    assert!(report.stopped);
    assert_eq!(report.files_analyzed, 2);
    assert_eq!(report.bytes_hashed, 0);
    assert!(report.hashed.is_empty());
    assert!(!report.has_duplicates());
    assert!(recorder.hashed.lock().unwrap().is_empty());
}

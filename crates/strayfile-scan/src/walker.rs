//! JWalk-based resumable filesystem walker.

use std::collections::VecDeque;
use std::fs::Metadata;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use jwalk::{DirEntry, Parallelism, WalkDir};
use tracing::{debug, warn};

use strayfile_core::{EngineConfig, InodeInfo, ObservedFile, ScanError, ScanWarning, WarningKind};

use crate::inode::InodeTracker;

type EntryIter = Box<dyn Iterator<Item = Result<DirEntry<((), ())>, jwalk::Error>>>;

/// Walk behaviour derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Number of threads for reading directories (0 = auto-detect).
    pub threads: usize,
    pub include_hidden: bool,
    pub follow_symlinks: bool,
    /// Entries whose name or full path matches are skipped with their subtree.
    pub ignore: GlobSet,
    /// Per-entry errors tolerated before the walk aborts.
    pub max_errors: Option<u64>,
}

impl WalkOptions {
    pub fn from_config(config: &EngineConfig) -> Result<Self, ScanError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore_patterns {
            let glob = Glob::new(pattern).map_err(|e| ScanError::InvalidConfig {
                message: format!("bad ignore pattern {pattern:?}: {e}"),
            })?;
            builder.add(glob);
        }
        let ignore = builder.build().map_err(|e| ScanError::InvalidConfig {
            message: e.to_string(),
        })?;
        Ok(Self {
            threads: config.scan_threads,
            include_hidden: config.include_hidden,
            follow_symlinks: config.follow_symlinks,
            ignore,
            max_errors: config.max_walk_errors,
        })
    }

    fn is_ignored(&self, name: &str, path: &Path) -> bool {
        !self.ignore.is_empty() && (self.ignore.is_match(name) || self.ignore.is_match(path))
    }
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            include_hidden: true,
            follow_symlinks: false,
            ignore: GlobSet::empty(),
            max_errors: None,
        }
    }
}

/// One item produced by a [`Walk`].
#[derive(Debug, Clone)]
pub enum WalkEvent {
    File(ObservedFile),
    Warning(ScanWarning),
    /// A directory whose entries could not be listed. Nothing is known about
    /// its subtree; `warning.path` is the directory.
    Unreadable(ScanWarning),
}

/// Running totals for a walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub files: u64,
    pub dirs: u64,
    pub total_bytes: u64,
    /// Bytes with every hardlinked inode counted once.
    pub unique_bytes: u64,
    pub warnings: u64,
    pub unreadable_dirs: u64,
    /// Roots skipped entirely because they sort before the resume cursor.
    pub roots_skipped: u64,
}

/// Produces on-disk files for a set of roots in lexical path order.
#[derive(Debug, Clone, Default)]
pub struct FileSystemWalker {
    options: WalkOptions,
}

impl FileSystemWalker {
    pub fn new(options: WalkOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ScanError> {
        Ok(Self::new(WalkOptions::from_config(config)?))
    }

    pub fn options(&self) -> &WalkOptions {
        &self.options
    }

    /// Canonicalize roots, drop nested duplicates and sort them in walk order.
    ///
    /// A root that cannot be read is fatal.
    pub fn prepare_roots(&self, roots: &[PathBuf]) -> Result<Vec<PathBuf>, ScanError> {
        let mut prepared = Vec::with_capacity(roots.len());
        for root in roots {
            let canonical = root
                .canonicalize()
                .map_err(|source| ScanError::RootInaccessible {
                    path: root.clone(),
                    source,
                })?;
            if !canonical.is_dir() {
                return Err(ScanError::NotADirectory { path: canonical });
            }
            std::fs::read_dir(&canonical).map_err(|source| ScanError::RootInaccessible {
                path: canonical.clone(),
                source,
            })?;
            prepared.push(canonical);
        }
        Ok(non_overlapping(prepared))
    }

    /// Start a lazy walk over prepared roots.
    ///
    /// With `resume_after`, every file ordered at or before the cursor is
    /// skipped, and directories whose whole subtree precedes it are not read.
    pub fn walk(&self, roots: &[PathBuf], resume_after: Option<PathBuf>) -> Walk {
        let mut sorted: Vec<PathBuf> = roots.to_vec();
        sorted.sort();
        Walk {
            options: self.options.clone(),
            pending_roots: sorted.into(),
            current: None,
            cursor: resume_after.map(Arc::new),
            stats: WalkStats::default(),
            inodes: InodeTracker::new(),
            errors: 0,
            aborted: false,
        }
    }

    /// Count the files under one root without stat'ing them.
    ///
    /// `tick` sees the running count after every file; returning
    /// [`ControlFlow::Break`] abandons the count and yields `None`.
    pub fn count_files<F>(&self, root: &Path, mut tick: F) -> Option<u64>
    where
        F: FnMut(u64) -> ControlFlow<()>,
    {
        let options = self.options.clone();
        let filter = options.clone();
        let entries = WalkDir::new(root)
            .parallelism(parallelism(options.threads))
            .skip_hidden(!options.include_hidden)
            .follow_links(options.follow_symlinks)
            .process_read_dir(move |_depth, _dir, _state, children| {
                children.retain(|child| match child {
                    Ok(entry) => !filter.is_ignored(&entry.file_name().to_string_lossy(), &entry.path()),
                    Err(_) => true,
                });
            });

        let mut count = 0;
        for entry in entries.into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            count += 1;
            if tick(count).is_break() {
                debug!(root = %root.display(), counted = count, "file count abandoned");
                return None;
            }
        }
        Some(count)
    }
}

/// Lazy, finite iterator over the files of several roots.
pub struct Walk {
    options: WalkOptions,
    pending_roots: VecDeque<PathBuf>,
    current: Option<EntryIter>,
    cursor: Option<Arc<PathBuf>>,
    stats: WalkStats,
    inodes: InodeTracker,
    errors: u64,
    aborted: bool,
}

impl Walk {
    pub fn stats(&self) -> &WalkStats {
        &self.stats
    }

    fn open_next_root(&mut self) -> bool {
        while let Some(root) = self.pending_roots.pop_front() {
            if let Some(cursor) = &self.cursor {
                if subtree_precedes(&root, cursor) {
                    debug!(root = %root.display(), "root precedes resume cursor, skipping");
                    self.stats.roots_skipped += 1;
                    continue;
                }
            }
            self.current = Some(self.open_root(&root));
            return true;
        }
        false
    }

    fn open_root(&self, root: &Path) -> EntryIter {
        let options = self.options.clone();
        let cursor = self.cursor.clone();

        let walker = WalkDir::new(root)
            .parallelism(parallelism(options.threads))
            .sort(true)
            .skip_hidden(!options.include_hidden)
            .follow_links(options.follow_symlinks)
            .process_read_dir(move |_depth, _dir, _state, children| {
                children.retain(|child| {
                    let Ok(entry) = child else { return true };
                    let path = entry.path();
                    if options.is_ignored(&entry.file_name().to_string_lossy(), &path) {
                        return false;
                    }
                    match &cursor {
                        Some(cursor) => !is_past_cursor(&path, entry.file_type().is_dir(), cursor),
                        None => true,
                    }
                });
            });

        Box::new(walker.into_iter())
    }

    fn record_error(&mut self, event: WalkEvent) -> Result<WalkEvent, ScanError> {
        self.errors += 1;
        self.stats.warnings += 1;
        if let WalkEvent::Unreadable(warning) = &event {
            self.stats.unreadable_dirs += 1;
            warn!(path = %warning.path.display(), "{}", warning.message);
        }
        if let Some(max) = self.options.max_errors {
            if self.errors > max {
                self.aborted = true;
                return Err(ScanError::TooManyErrors { count: self.errors });
            }
        }
        Ok(event)
    }

    fn handle_entry(&mut self, mut entry: DirEntry<((), ())>) -> Option<Result<WalkEvent, ScanError>> {
        let file_type = entry.file_type();
        let path = entry.path();

        if file_type.is_dir() {
            self.stats.dirs += 1;
            let err = entry.read_children_error.take()?;
            let warning = read_warning(&path, &err);
            return Some(self.record_error(WalkEvent::Unreadable(warning)));
        }

        if file_type.is_symlink() {
            // only reached when links are not followed
            if std::fs::metadata(&path).is_err() {
                let target = std::fs::read_link(&path)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                let warning = ScanWarning::broken_symlink(&path, &target);
                return Some(self.record_error(WalkEvent::Warning(warning)));
            }
            return None;
        }

        if !file_type.is_file() {
            return None;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                let warning = match err.io_error() {
                    Some(io) => ScanWarning::from_io(&path, io, WarningKind::MetadataError),
                    None => ScanWarning::new(&path, err.to_string(), WarningKind::MetadataError),
                };
                return Some(self.record_error(WalkEvent::Warning(warning)));
            }
        };

        let observed = observe(&path, &metadata);
        self.stats.files += 1;
        self.stats.total_bytes += observed.size;
        let info = InodeInfo::new(observed.inode, observed.device_id);
        if self.inodes.observe(info, get_nlink(&metadata)) {
            self.stats.unique_bytes += observed.size;
        }
        Some(Ok(WalkEvent::File(observed)))
    }
}

impl Iterator for Walk {
    type Item = Result<WalkEvent, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.aborted {
            return None;
        }
        loop {
            if self.current.is_none() && !self.open_next_root() {
                return None;
            }
            let next = self.current.as_mut().and_then(Iterator::next);
            match next {
                None => {
                    self.current = None;
                }
                Some(Err(err)) => {
                    // a listing error names the directory being read
                    let event = match err.path() {
                        Some(path) => WalkEvent::Unreadable(read_warning(path, &err)),
                        None => WalkEvent::Warning(read_warning(Path::new(""), &err)),
                    };
                    return Some(self.record_error(event));
                }
                Some(Ok(entry)) => {
                    if let Some(event) = self.handle_entry(entry) {
                        return Some(event);
                    }
                }
            }
        }
    }
}

fn read_warning(path: &Path, err: &jwalk::Error) -> ScanWarning {
    match err.io_error() {
        Some(io) => ScanWarning::from_io(path, io, WarningKind::ReadError),
        None => ScanWarning::new(path, err.to_string(), WarningKind::ReadError),
    }
}

/// Whether `path` is already covered by a walk that stopped at `cursor`.
///
/// Files at or before the cursor are done. A directory is done only when its
/// whole subtree sorts before the cursor.
pub fn is_past_cursor(path: &Path, is_dir: bool, cursor: &Path) -> bool {
    if is_dir {
        subtree_precedes(path, cursor)
    } else {
        path <= cursor
    }
}

fn subtree_precedes(dir: &Path, cursor: &Path) -> bool {
    dir < cursor && !cursor.starts_with(dir)
}

/// Build an observation from filesystem metadata.
pub fn observe(path: &Path, metadata: &Metadata) -> ObservedFile {
    let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
    ObservedFile {
        path: path.to_path_buf(),
        size: metadata.len(),
        inode: get_ino(metadata),
        device_id: get_dev(metadata),
        modified: DateTime::<Utc>::from(modified),
    }
}

fn parallelism(threads: usize) -> Parallelism {
    match threads {
        0 => Parallelism::RayonDefaultPool {
            busy_timeout: Duration::from_millis(100),
        },
        n => Parallelism::RayonNewPool(n),
    }
}

/// Remove roots nested inside other roots.
fn non_overlapping(mut roots: Vec<PathBuf>) -> Vec<PathBuf> {
    roots.sort();
    roots.dedup();
    let mut result: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        // sorted order puts a parent right before its descendants
        if result.last().is_some_and(|parent| root.starts_with(parent)) {
            continue;
        }
        result.push(root);
    }
    result
}

// Cross-platform metadata helpers

/// Get the device ID from metadata.
#[cfg(unix)]
fn get_dev(metadata: &Metadata) -> u64 {
    metadata.dev()
}

#[cfg(not(unix))]
fn get_dev(_metadata: &Metadata) -> u64 {
    0
}

/// Get the inode number from metadata.
#[cfg(unix)]
fn get_ino(metadata: &Metadata) -> u64 {
    metadata.ino()
}

#[cfg(not(unix))]
fn get_ino(_metadata: &Metadata) -> u64 {
    0
}

#[cfg(unix)]
fn get_nlink(metadata: &Metadata) -> u64 {
    metadata.nlink()
}

#[cfg(not(unix))]
fn get_nlink(_metadata: &Metadata) -> u64 {
    1
}

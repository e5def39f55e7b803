//! Filesystem walking engine for strayfile.
//!
//! This crate turns configured roots into a lazy stream of observed files
//! and keeps the stored file records in step with what it sees.
//!
//! # Overview
//!
//! - **Lexical order.** Entries come out in depth-first, name-sorted order,
//!   which is the component-wise ordering of [`std::path::Path`]. The last
//!   processed path is therefore a valid resume cursor.
//! - **Resume.** Given a cursor, files at or before it are pruned while
//!   reading directories, so they are never stat'ed again.
//! - **Error policy.** Per-entry failures surface as warnings; only an
//!   inaccessible root (or an optional error ceiling) is fatal. A directory
//!   that cannot be listed is reported as unreadable so its records are not
//!   mistaken for deleted files.
//!
//! # Example
//!
//! ```rust,no_run
//! use strayfile_core::EngineConfig;
//! use strayfile_scan::{FileSystemWalker, WalkEvent};
//!
//! let config = EngineConfig::new(["/mnt/media"]);
//! let walker = FileSystemWalker::from_config(&config).unwrap();
//! let roots = walker.prepare_roots(&config.roots).unwrap();
//!
//! for event in walker.walk(&roots, None) {
//!     match event.unwrap() {
//!         WalkEvent::File(file) => println!("{} ({} bytes)", file.path.display(), file.size),
//!         WalkEvent::Warning(warning) | WalkEvent::Unreadable(warning) => eprintln!("{warning}"),
//!     }
//! }
//! ```

mod inode;
mod sync;
mod walker;

pub use inode::InodeTracker;
pub use sync::{
    RescanOutcome, SweepCounts, SyncCounts, SyncOutcome, WalkMode, rescan_path, sweep_unverified,
    sync_entry,
};
pub use walker::{FileSystemWalker, Walk, WalkEvent, WalkOptions, WalkStats, is_past_cursor, observe};

// Re-export core types for convenience
pub use strayfile_core::{ObservedFile, ScanError, ScanWarning, WarningKind};

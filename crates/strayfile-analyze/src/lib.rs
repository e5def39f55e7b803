//! Space-accounting views over stored file records.
//!
//! - **Hardlink grouping** - files sharing `(device, inode)` and the space
//!   the links save
//! - **Duplicate detection** - files with identical content, found with
//!   progressive BLAKE3 hashing
//!
//! The two views are independent: a hardlinked file is still a content
//! duplicate candidate.
//!
//! # Duplicate Detection
//!
//! 1. Group files by size (instant)
//! 2. Hash a 1 MiB prefix of every size-matched file
//! 3. Escalate colliding files through larger prefixes up to the full file
//!
//! ```rust,ignore
//! use strayfile_analyze::{DuplicateConfig, DuplicateDetector};
//! use strayfile_core::{FileQuery, MemoryStore, PersistenceGateway};
//!
//! let store = MemoryStore::open("library.json".as_ref())?;
//! let files = store.list_files(&FileQuery::all())?;
//!
//! let detector = DuplicateDetector::new();
//! let report = detector.find_duplicates(&files);
//!
//! println!("Found {} duplicate groups", report.group_count());
//! println!("Wasted space: {} bytes", report.total_wasted_space);
//! ```
//!
//! # Hardlinks
//!
//! ```rust,ignore
//! use strayfile_analyze::HardlinkGrouper;
//!
//! let report = HardlinkGrouper::new().group(&files);
//! for group in &report.groups {
//!     println!("{} links save {} bytes", group.link_count(), group.space_saved);
//! }
//! ```

mod duplicates;
mod hardlinks;

pub use duplicates::{
    DiskClass, DuplicateConfig, DuplicateConfigBuilder, DuplicateDetector, DuplicateFile,
    DuplicateGroup, DuplicateReport, HashObserver, HashProgress, HashedFile, hash_file,
};
pub use hardlinks::{HardlinkGroup, HardlinkGrouper, HardlinkMember, HardlinkReport};

// Re-export core types
pub use strayfile_core::{ContentHash, FileRecord, HashLevels};

//! Inode tracking for hardlink-aware byte totals.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strayfile_core::InodeInfo;

/// Tracks multiply-linked inodes so their bytes count once.
///
/// Only inodes with more than one link are held, each until all of its
/// links have been seen. Memory follows the number of partially walked
/// hardlink sets, not the number of files.
#[derive(Debug, Default)]
pub struct InodeTracker {
    /// Links still expected per inode.
    outstanding: DashMap<InodeInfo, u64>,
}

impl InodeTracker {
    pub fn new() -> Self {
        Self {
            outstanding: DashMap::new(),
        }
    }

    /// Record one path to `info`, an inode with `nlink` links. Returns `true`
    /// the first time the inode is seen.
    pub fn observe(&self, info: InodeInfo, nlink: u64) -> bool {
        if nlink <= 1 {
            return true;
        }
        match self.outstanding.entry(info) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(nlink - 1);
                true
            }
        }
    }
}

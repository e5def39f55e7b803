//! Hardlink grouping by `(device, inode)` identity.

use std::path::PathBuf;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::warn;

use strayfile_core::{FileId, FileRecord, InodeInfo, ScanWarning, WarningKind};

/// One path of a hardlink group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardlinkMember {
    pub id: FileId,
    pub path: PathBuf,
    pub size: u64,
}

/// Files sharing one inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardlinkGroup {
    pub identity: InodeInfo,
    /// Members in path order.
    pub members: Vec<HardlinkMember>,
    /// Smallest size observed among members.
    pub representative_size: u64,
    /// `(members - 1) * representative_size`.
    pub space_saved: u64,
    /// Members disagreed on size.
    pub size_mismatch: bool,
}

impl HardlinkGroup {
    pub fn link_count(&self) -> usize {
        self.members.len()
    }
}

/// Results from hardlink grouping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardlinkReport {
    /// Groups sorted by space saved descending.
    pub groups: Vec<HardlinkGroup>,
    pub total_space_saved: u64,
    /// Files belonging to some group.
    pub linked_files: u64,
    pub warnings: Vec<ScanWarning>,
}

impl HardlinkReport {
    pub fn has_hardlinks(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Groups file records by shared inode.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardlinkGrouper;

impl HardlinkGrouper {
    pub fn new() -> Self {
        Self
    }

    pub fn group(&self, files: &[FileRecord]) -> HardlinkReport {
        let mut report = HardlinkReport::default();

        let by_identity = files.iter().into_group_map_by(|f| f.inode_info());
        for (identity, members) in by_identity {
            if members.len() < 2 {
                continue;
            }
            let group = build_group(identity, members);
            if group.size_mismatch {
                let sizes = group.members.iter().map(|m| m.size).join(", ");
                warn!(
                    inode = identity.inode,
                    device = identity.device,
                    sizes = %sizes,
                    "hardlink group members disagree on size"
                );
                report.warnings.push(ScanWarning::new(
                    &group.members[0].path,
                    format!(
                        "Hardlink group (device {}, inode {}) has mismatched sizes [{sizes}], using {}",
                        identity.device, identity.inode, group.representative_size
                    ),
                    WarningKind::SizeMismatch,
                ));
            }
            report.linked_files += group.members.len() as u64;
            report.total_space_saved += group.space_saved;
            report.groups.push(group);
        }

        report.groups.sort_by(|a, b| {
            b.space_saved
                .cmp(&a.space_saved)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        report
    }
}

fn build_group(identity: InodeInfo, members: Vec<&FileRecord>) -> HardlinkGroup {
    let mut members: Vec<HardlinkMember> = members
        .into_iter()
        .map(|f| HardlinkMember {
            id: f.id,
            path: f.path.clone(),
            size: f.size,
        })
        .collect();
    members.sort_by(|a, b| a.path.cmp(&b.path));

    let representative_size = members.iter().map(|m| m.size).min().unwrap_or(0);
    let size_mismatch = members.iter().any(|m| m.size != representative_size);
    let space_saved = (members.len() as u64 - 1) * representative_size;

    HardlinkGroup {
        identity,
        members,
        representative_size,
        space_saved,
        size_mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strayfile_core::ObservedFile;

    fn record(id: u64, path: &str, size: u64, inode: u64, device: u64) -> FileRecord {
        let observed = ObservedFile {
            path: PathBuf::from(path),
            size,
            inode,
            device_id: device,
            modified: Utc::now(),
        };
        FileRecord::from_observed(FileId(id), &observed, Utc::now())
    }

    #[test]
    fn test_two_links_save_one_copy() {
        let files = vec![
            record(1, "/m/a.mkv", 100, 7, 1),
            record(2, "/t/a.mkv", 100, 7, 1),
            record(3, "/m/b.mkv", 50, 8, 1),
        ];
        let report = HardlinkGrouper::new().group(&files);
        assert_eq!(report.group_count(), 1);
        assert_eq!(report.groups[0].space_saved, 100);
        assert_eq!(report.linked_files, 2);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_same_inode_other_device_is_not_linked() {
        let files = vec![record(1, "/a", 10, 7, 1), record(2, "/b", 10, 7, 2)];
        assert!(!HardlinkGrouper::new().group(&files).has_hardlinks());
    }

    #[test]
    fn test_size_mismatch_uses_minimum() {
        let files = vec![
            record(1, "/a", 120, 7, 1),
            record(2, "/b", 100, 7, 1),
            record(3, "/c", 110, 7, 1),
        ];
        let report = HardlinkGrouper::new().group(&files);
        let group = &report.groups[0];
        assert!(group.size_mismatch);
        assert_eq!(group.representative_size, 100);
        assert_eq!(group.space_saved, 200);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::SizeMismatch);
    }
}

//! Scan run records and the scan state machine vocabulary.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::record::ServiceId;

/// Unique identifier of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum ScanStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Interrupted,
    Cancelled,
}

impl ScanStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether a scan in this status can be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Cancelled)
    }
}

/// Kind of work a scan performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanType {
    /// Walk every root, sweep deleted files, reconcile all services.
    Full,
    /// Walk with the cheap unchanged path and no deletion sweep.
    Incremental,
    /// Record physical disk locations for a pooled volume.
    DiskLocation,
    /// Reconcile a single service.
    ServiceUpdate(ServiceId),
    /// Progressive content hashing over known files.
    HashScan,
    /// Re-stat known files and drop the ones that disappeared.
    Cleanup,
    /// Re-stat an explicit list of paths.
    FileRescan,
}

impl ScanType {
    /// Scan types that walk the filesystem and can resume from a cursor.
    pub fn walks_filesystem(&self) -> bool {
        matches!(self, Self::Full | Self::Incremental)
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
            Self::DiskLocation => write!(f, "disk-location"),
            Self::ServiceUpdate(service) => write!(f, "service-update:{service}"),
            Self::HashScan => write!(f, "hash"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::FileRescan => write!(f, "file-rescan"),
        }
    }
}

/// Phase of a running scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    Idle,
    Initializing,
    CountingFiles,
    ScanningFilesystem,
    CheckingService {
        service: ServiceId,
        index: usize,
        total: usize,
    },
    UpdatingOrphanedStatus,
    HashingFiles,
    LocatingDisks,
    VerifyingFiles,
    Finished(ScanStatus),
}

impl ScanPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Initializing => write!(f, "Initializing"),
            Self::CountingFiles => write!(f, "Counting files"),
            Self::ScanningFilesystem => write!(f, "Scanning filesystem"),
            Self::CheckingService {
                service,
                index,
                total,
            } => write!(f, "Checking service {service} ({index}/{total})"),
            Self::UpdatingOrphanedStatus => write!(f, "Updating orphaned status"),
            Self::HashingFiles => write!(f, "Hashing files"),
            Self::LocatingDisks => write!(f, "Locating disks"),
            Self::VerifyingFiles => write!(f, "Verifying files"),
            Self::Finished(status) => write!(f, "{status}"),
        }
    }
}

/// Parameters for creating a scan record.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub scan_type: ScanType,
    pub resume_from: Option<ScanId>,
    pub started_at: DateTime<Utc>,
}

/// One scan run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub status: ScanStatus,
    pub scan_type: ScanType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last time the scan reported progress. Drives staleness detection.
    pub updated_at: DateTime<Utc>,
    pub current_phase: String,
    /// Resume checkpoint in walker order.
    pub last_processed_path: Option<PathBuf>,
    pub resume_from_scan_id: Option<ScanId>,
    pub files_scanned: u64,
    pub deleted_files_count: u64,
    /// Bounded error log.
    pub errors: Vec<String>,
    /// Total errors seen, including those dropped from `errors`.
    pub error_count: u64,
    /// Directories the walk could not list. Records under them are not swept.
    #[serde(default)]
    pub unreadable_dirs: Vec<PathBuf>,
}

impl ScanRecord {
    pub fn new(id: ScanId, new: NewScan) -> Self {
        Self {
            id,
            status: ScanStatus::Running,
            scan_type: new.scan_type,
            started_at: new.started_at,
            completed_at: None,
            updated_at: new.started_at,
            current_phase: ScanPhase::Initializing.to_string(),
            last_processed_path: None,
            resume_from_scan_id: new.resume_from,
            files_scanned: 0,
            deleted_files_count: 0,
            errors: Vec::new(),
            error_count: 0,
            unreadable_dirs: Vec::new(),
        }
    }

    /// Record an error, keeping at most `cap` messages.
    pub fn record_error(&mut self, message: impl Into<String>, cap: usize) {
        self.error_count += 1;
        if self.errors.len() < cap {
            self.errors.push(message.into());
        }
    }

    /// A running scan with no update within `window` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        self.status == ScanStatus::Running && now.signed_duration_since(self.updated_at) > window
    }

    /// Move to a terminal status.
    pub fn finish(&mut self, status: ScanStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        self.updated_at = at;
        self.current_phase = ScanPhase::Finished(status).to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    fn record() -> ScanRecord {
        ScanRecord::new(
            ScanId(1),
            NewScan {
                scan_type: ScanType::Full,
                resume_from: None,
                started_at: Utc::now(),
            },
        )
    }

    #[test]
    fn test_error_log_is_capped() {
        let mut scan = record();
        for i in 0..10 {
            scan.record_error(format!("error {i}"), 3);
        }
        assert_eq!(scan.errors.len(), 3);
        assert_eq!(scan.error_count, 10);
    }

    #[test]
    fn test_staleness() {
        let mut scan = record();
        let now = scan.updated_at + ChronoDuration::seconds(120);
        assert!(scan.is_stale(now, Duration::from_secs(60)));
        assert!(!scan.is_stale(now, Duration::from_secs(600)));

        scan.finish(ScanStatus::Completed, now);
        assert!(!scan.is_stale(now + ChronoDuration::hours(5), Duration::from_secs(60)));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            ScanStatus::from_str("CompletedWithErrors").unwrap(),
            ScanStatus::CompletedWithErrors
        );
        assert!(ScanStatus::Interrupted.is_resumable());
        assert!(!ScanStatus::Failed.is_resumable());
    }

    #[test]
    fn test_phase_labels() {
        let phase = ScanPhase::CheckingService {
            service: ServiceId::from("radarr"),
            index: 2,
            total: 3,
        };
        assert_eq!(phase.to_string(), "Checking service radarr (2/3)");
        assert_eq!(
            ScanPhase::Finished(ScanStatus::Cancelled).to_string(),
            "Cancelled"
        );
    }
}

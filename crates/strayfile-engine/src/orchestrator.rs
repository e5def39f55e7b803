//! Scan lifecycle: one scan at a time, phased execution, checkpoints,
//! cancellation and resume.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strayfile_analyze::{
    DuplicateConfig, DuplicateDetector, DuplicateReport, HardlinkGrouper, HardlinkReport,
    HashObserver, HashProgress, HashedFile,
};
use strayfile_core::{
    ContentHash, DiskPoolConfig, EngineConfig, FileDiskLocation, FileId, FileQuery, FileRecord,
    HashLevel, NewScan, PersistenceGateway, ScanError, ScanId, ScanPhase, ScanRecord, ScanStatus,
    ScanType, ScanWarning, ServiceId, ServiceMissingEntry, StoreError, StoreResult, WarningKind,
};
use strayfile_reconcile::{
    MappingValidation, OrphanSummary, PathTranslator, ProviderRegistry, ProviderResult,
    ReconcileEvent, ReconcileObserver, ReconcileReport, ServiceOutcome, ServiceReconciler,
};
use strayfile_scan::{
    FileSystemWalker, RescanOutcome, SyncCounts, WalkEvent, WalkMode, WalkStats, observe,
    rescan_path, sweep_unverified, sync_entry,
};

/// Files counted between heartbeats while counting a root.
const COUNT_HEARTBEAT: u64 = 10_000;

use crate::error::{EngineError, EngineResult};
use crate::progress::{ProgressSnapshot, ProgressTracker, SubscriberId};
use crate::stats::{LibraryStats, StatsCache};

/// What a caller asks the orchestrator to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRequest {
    Full,
    Incremental,
    ServiceUpdate(ServiceId),
    HashScan,
    DiskLocation,
    Cleanup,
    FileRescan(Vec<PathBuf>),
    /// Continue the most recent interrupted or cancelled scan.
    Resume,
}

/// Hashing results of a [`ScanType::HashScan`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashSummary {
    /// Records whose stored hash was written or upgraded.
    pub files_hashed: u64,
    pub hashes_reused: u64,
    pub bytes_hashed: u64,
    pub duplicate_groups: u64,
    pub wasted_bytes: u64,
}

/// Everything a finished scan produced.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    /// Final persisted scan record.
    pub scan: ScanRecord,
    pub sync: SyncCounts,
    pub walk: Option<WalkStats>,
    /// Records removed because their file disappeared.
    pub deleted: u64,
    pub reconcile: Option<ReconcileReport>,
    pub orphans: Option<OrphanSummary>,
    pub hashing: Option<HashSummary>,
    pub disk_locations: u64,
}

impl ScanSummary {
    pub fn status(&self) -> ScanStatus {
        self.scan.status
    }
}

/// A scan running on the tokio runtime.
#[derive(Debug)]
pub struct ScanHandle {
    id: ScanId,
    cancel: CancellationToken,
    force: CancellationToken,
    task: JoinHandle<EngineResult<ScanSummary>>,
}

impl ScanHandle {
    pub fn id(&self) -> ScanId {
        self.id
    }

    /// Stop after the current unit of work; the scan ends `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop without waiting; the scan ends `Interrupted`.
    pub fn force_stop(&self) {
        self.force.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> EngineResult<ScanSummary> {
        self.task.await?
    }
}

/// Drives scans against one store, config and provider registry.
///
/// At most one scan runs at a time, across this process and, through the
/// store's `Running` record, across processes.
pub struct ScanOrchestrator {
    store: Arc<dyn PersistenceGateway>,
    config: Arc<EngineConfig>,
    reconciler: ServiceReconciler,
    walker: FileSystemWalker,
    tracker: Arc<ProgressTracker>,
    stats: StatsCache,
    active: Arc<Mutex<Option<ActiveScan>>>,
}

#[derive(Debug, Clone)]
struct ActiveScan {
    id: Option<ScanId>,
    cancel: CancellationToken,
    force: CancellationToken,
}

/// Releases the single-scan slot when dropped.
struct SlotGuard(Arc<Mutex<Option<ActiveScan>>>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Work a scan performs once its record exists.
#[derive(Debug, Clone)]
enum Job {
    Walk(WalkMode),
    Service(ServiceId),
    Hash,
    Disks,
    Cleanup,
    Rescan(Vec<PathBuf>),
}

impl Job {
    fn scan_type(&self) -> ScanType {
        match self {
            Self::Walk(WalkMode::Full) => ScanType::Full,
            Self::Walk(WalkMode::Incremental) => ScanType::Incremental,
            Self::Service(service) => ScanType::ServiceUpdate(service.clone()),
            Self::Hash => ScanType::HashScan,
            Self::Disks => ScanType::DiskLocation,
            Self::Cleanup => ScanType::Cleanup,
            Self::Rescan(_) => ScanType::FileRescan,
        }
    }

    fn from_scan_type(scan_type: &ScanType) -> Option<Self> {
        match scan_type {
            ScanType::Full => Some(Self::Walk(WalkMode::Full)),
            ScanType::Incremental => Some(Self::Walk(WalkMode::Incremental)),
            ScanType::ServiceUpdate(service) => Some(Self::Service(service.clone())),
            ScanType::HashScan => Some(Self::Hash),
            ScanType::DiskLocation => Some(Self::Disks),
            ScanType::Cleanup => Some(Self::Cleanup),
            // the explicit path list is not persisted
            ScanType::FileRescan => None,
        }
    }

    fn reconciles(&self) -> bool {
        matches!(self, Self::Walk(_) | Self::Service(_))
    }
}

#[derive(Debug, Clone)]
struct ResumePlan {
    from: ScanId,
    cursor: Option<PathBuf>,
    /// Start of the first scan in the resume chain.
    sweep_cutoff: DateTime<Utc>,
    /// Unreadable directories found earlier in the chain.
    unreadable_dirs: Vec<PathBuf>,
}

struct Prepared {
    run: ScanRun,
    job: Job,
    resume: Option<ResumePlan>,
    force: CancellationToken,
    _slot: SlotGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished { service_failures: bool },
    Stopped(Stop),
}

enum Ending {
    Done(EngineResult<Outcome>),
    Forced,
    TimedOut,
}

#[derive(Debug, Default)]
struct Parts {
    sync: SyncCounts,
    walk: Option<WalkStats>,
    deleted: u64,
    reconcile: Option<ReconcileReport>,
    orphans: Option<OrphanSummary>,
    hashing: Option<HashSummary>,
    disk_locations: u64,
}

impl ScanOrchestrator {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        config: Arc<EngineConfig>,
        registry: Arc<ProviderRegistry>,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|message| ScanError::InvalidConfig { message })?;
        let walker = FileSystemWalker::from_config(&config)?;
        let translator = Arc::new(PathTranslator::from_config(&config));
        let reconciler =
            ServiceReconciler::new(Arc::clone(&store), registry, translator, Arc::clone(&config));

        Ok(Self {
            stats: StatsCache::new(config.stats_cache_ttl()),
            store,
            config,
            reconciler,
            walker,
            tracker: Arc::new(ProgressTracker::default()),
            active: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PersistenceGateway> {
        &self.store
    }

    pub fn reconciler(&self) -> &ServiceReconciler {
        &self.reconciler
    }

    pub fn translator(&self) -> &Arc<PathTranslator> {
        self.reconciler.translator()
    }

    // --- lifecycle ---

    /// Run a scan to completion on the current task.
    pub async fn run(&self, request: ScanRequest) -> EngineResult<ScanSummary> {
        let prepared = self.prepare(request).await?;
        self.drive(prepared).await
    }

    /// Start a scan in the background.
    ///
    /// Returns once the scan record exists, so a rejected start is reported
    /// here rather than through the handle.
    pub async fn start(self: &Arc<Self>, request: ScanRequest) -> EngineResult<ScanHandle> {
        let prepared = self.prepare(request).await?;
        let id = prepared.run.id;
        let cancel = prepared.run.cancel.clone();
        let force = prepared.force.clone();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.drive(prepared).await });
        Ok(ScanHandle {
            id,
            cancel,
            force,
            task,
        })
    }

    /// Gracefully cancel the scan running in this process.
    pub fn cancel(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Force-stop the scan running in this process.
    pub fn force_stop(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(active) => {
                active.force.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active.lock().is_some()
    }

    async fn prepare(&self, request: ScanRequest) -> EngineResult<Prepared> {
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let slot = {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref() {
                return Err(EngineError::ScanAlreadyRunning { id: current.id });
            }
            *active = Some(ActiveScan {
                id: None,
                cancel: cancel.clone(),
                force: force.clone(),
            });
            SlotGuard(Arc::clone(&self.active))
        };

        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let (record, job, resume) = blocking(move || {
            if let Some(running) = reclassify_stale(store.as_ref(), &config, None)? {
                return Err(EngineError::ScanAlreadyRunning {
                    id: Some(running.id),
                });
            }

            let (job, resume) = match request {
                ScanRequest::Resume => {
                    let (job, plan) = plan_resume(store.as_ref())?;
                    (job, Some(plan))
                }
                ScanRequest::Full => (Job::Walk(WalkMode::Full), None),
                ScanRequest::Incremental => (Job::Walk(WalkMode::Incremental), None),
                ScanRequest::ServiceUpdate(service) => (Job::Service(service), None),
                ScanRequest::HashScan => (Job::Hash, None),
                ScanRequest::DiskLocation => (Job::Disks, None),
                ScanRequest::Cleanup => (Job::Cleanup, None),
                ScanRequest::FileRescan(paths) => (Job::Rescan(paths), None),
            };

            let record = store
                .create_scan(NewScan {
                    scan_type: job.scan_type(),
                    resume_from: resume.as_ref().map(|r| r.from),
                    started_at: Utc::now(),
                })
                .map_err(|err| match err {
                    StoreError::Conflict { .. } => EngineError::ScanAlreadyRunning { id: None },
                    other => EngineError::Store(other),
                })?;
            Ok((record, job, resume))
        })
        .await?;

        if let Some(active) = self.active.lock().as_mut() {
            active.id = Some(record.id);
        }
        self.tracker.begin(record.id, record.started_at);

        let run = ScanRun {
            id: record.id,
            started_at: record.started_at,
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            tracker: Arc::clone(&self.tracker),
            record: Arc::new(Mutex::new(record)),
            cancel,
            halt: CancellationToken::new(),
        };

        Ok(Prepared {
            run,
            job,
            resume,
            force,
            _slot: slot,
        })
    }

    async fn drive(&self, prepared: Prepared) -> EngineResult<ScanSummary> {
        let Prepared {
            run,
            job,
            resume,
            force,
            _slot,
        } = prepared;

        let started = Instant::now();
        match &resume {
            Some(plan) => run.log(format!(
                "Resuming {} scan {} from scan {}{}",
                job.scan_type(),
                run.id,
                plan.from,
                plan.cursor
                    .as_ref()
                    .map(|c| format!(" after {}", c.display()))
                    .unwrap_or_default()
            )),
            None => run.log(format!("Starting {} scan {}", job.scan_type(), run.id)),
        }
        info!(scan = %run.id, scan_type = %job.scan_type(), resumed = resume.is_some(), "scan started");

        let ceiling = self.config.max_scan_duration();
        let mut parts = Parts::default();
        let ending = tokio::select! {
            _ = force.cancelled() => Ending::Forced,
            _ = tokio::time::sleep(ceiling) => Ending::TimedOut,
            result = self.execute(&run, &job, resume.as_ref(), &mut parts) => Ending::Done(result),
        };
        // stops any blocking work the dropped future left behind
        run.halt.cancel();

        let status = match ending {
            Ending::Done(Ok(Outcome::Finished { service_failures })) => {
                if service_failures {
                    ScanStatus::CompletedWithErrors
                } else {
                    ScanStatus::Completed
                }
            }
            Ending::Done(Ok(Outcome::Stopped(Stop::Cancelled))) => {
                run.log("Scan cancelled");
                ScanStatus::Cancelled
            }
            Ending::Done(Ok(Outcome::Stopped(Stop::Halted))) | Ending::Forced => {
                run.log("Scan force-stopped");
                ScanStatus::Interrupted
            }
            Ending::TimedOut => {
                run.error(format!(
                    "Scan exceeded the maximum duration of {}s",
                    ceiling.as_secs()
                ));
                ScanStatus::Interrupted
            }
            Ending::Done(Err(err)) => {
                warn!(scan = %run.id, error = %err, "scan failed");
                run.error(err.to_string());
                ScanStatus::Failed
            }
        };

        let w = run.clone();
        let scan = blocking(move || Ok(w.finish(status)?)).await?;
        self.stats.invalidate();
        self.tracker.finish(status);
        run.log(format!(
            "Scan {} {} after {:.1?}: {} files, {} errors",
            run.id,
            status,
            started.elapsed(),
            scan.files_scanned,
            scan.error_count
        ));
        info!(scan = %run.id, %status, files = scan.files_scanned, errors = scan.error_count, "scan finished");

        Ok(ScanSummary {
            scan,
            sync: parts.sync,
            walk: parts.walk,
            deleted: parts.deleted,
            reconcile: parts.reconcile,
            orphans: parts.orphans,
            hashing: parts.hashing,
            disk_locations: parts.disk_locations,
        })
    }

    async fn execute(
        &self,
        run: &ScanRun,
        job: &Job,
        resume: Option<&ResumePlan>,
        parts: &mut Parts,
    ) -> EngineResult<Outcome> {
        if job.reconciles() {
            let store = Arc::clone(&run.store);
            blocking(move || Ok(store.clear_service_missing()?)).await?;
        }

        match job {
            Job::Walk(mode) => self.filesystem_scan(run, *mode, resume, parts).await,
            Job::Service(service) => self.service_update(run, service, parts).await,
            Job::Hash => {
                let w = run.clone();
                let config = DuplicateConfig::from_engine(&self.config);
                let (outcome, summary) = blocking(move || hash_files(&w, config)).await?;
                parts.hashing = Some(summary);
                Ok(outcome)
            }
            Job::Disks => {
                let Some(pool) = self.config.disk_pool.clone() else {
                    return Err(ScanError::InvalidConfig {
                        message: "disk location scan needs a disk pool".to_string(),
                    }
                    .into());
                };
                let w = run.clone();
                let (outcome, located) = blocking(move || locate_disks(&w, &pool)).await?;
                parts.disk_locations = located;
                Ok(outcome)
            }
            Job::Cleanup => {
                let w = run.clone();
                let (stop, counts, deleted) = blocking(move || verify_stored(&w)).await?;
                parts.sync = counts;
                parts.deleted = deleted;
                self.finish_with_orphans(run, stop, false, parts).await
            }
            Job::Rescan(paths) => {
                let w = run.clone();
                let paths = paths.clone();
                let (stop, counts, deleted) = blocking(move || verify_paths(&w, &paths)).await?;
                parts.sync = counts;
                parts.deleted = deleted;
                self.finish_with_orphans(run, stop, false, parts).await
            }
        }
    }

    async fn filesystem_scan(
        &self,
        run: &ScanRun,
        mode: WalkMode,
        resume: Option<&ResumePlan>,
        parts: &mut Parts,
    ) -> EngineResult<Outcome> {
        if let Some(plan) = resume {
            run.record
                .lock()
                .unreadable_dirs
                .extend(plan.unreadable_dirs.iter().cloned());
        }
        let w = run.clone();
        let walker = self.walker.clone();
        let roots = self.config.roots.clone();
        let cursor = resume.and_then(|plan| plan.cursor.clone());
        let walked = blocking(move || walk_roots(&w, &walker, &roots, mode, cursor)).await?;
        parts.sync = walked.counts;
        parts.walk = Some(walked.stats);
        if let Some(stop) = walked.stopped {
            return Ok(Outcome::Stopped(stop));
        }
        run.log(format!(
            "Walk finished: {} new, {} updated, {} unchanged",
            walked.counts.inserted, walked.counts.updated, walked.counts.verified
        ));

        if mode == WalkMode::Full {
            let cutoff = resume.map_or(run.started_at, |plan| plan.sweep_cutoff);
            let w = run.clone();
            let swept = blocking(move || {
                let unreadable = w.record.lock().unreadable_dirs.clone();
                let swept = sweep_unverified(
                    w.store.as_ref(),
                    cutoff,
                    w.config.checkpoint_batch_size(),
                    &unreadable,
                )?;
                w.record.lock().deleted_files_count += swept.deleted;
                Ok(swept)
            })
            .await?;
            parts.deleted = swept.deleted;
            if swept.deleted > 0 {
                run.log(format!("Removed {} files no longer on disk", swept.deleted));
            }
            if swept.spared > 0 {
                run.log(format!(
                    "Kept {} unverified files under unreadable directories",
                    swept.spared
                ));
            }
        }

        self.reconcile_services(run, parts).await
    }

    async fn reconcile_services(&self, run: &ScanRun, parts: &mut Parts) -> EngineResult<Outcome> {
        if self.reconciler.active_services().is_empty() {
            run.log("No services configured");
        }
        let report = self
            .reconciler
            .reconcile_all(&run.cancel, Some(run.observer()))
            .await?;

        for err in report.failed.iter().filter(|e| !e.is_cancelled()) {
            run.error(err.to_string());
        }
        if report.aborted > 0 {
            run.error(format!("{} service tasks aborted unexpectedly", report.aborted));
        }
        if report.retired > 0 {
            run.log(format!("Retired {} usages of disabled services", report.retired));
        }
        let failures = report.has_failures();
        let cancelled = report.was_cancelled();
        parts.reconcile = Some(report);

        let stop = if cancelled { Some(Stop::Cancelled) } else { run.should_stop() };
        self.finish_with_orphans(run, stop, failures, parts).await
    }

    async fn service_update(
        &self,
        run: &ScanRun,
        service: &ServiceId,
        parts: &mut Parts,
    ) -> EngineResult<Outcome> {
        let w = run.clone();
        let phase = ScanPhase::CheckingService {
            service: service.clone(),
            index: 1,
            total: 1,
        };
        blocking(move || Ok(w.set_phase(phase)?)).await?;

        let mut report = ReconcileReport::default();
        match self.reconciler.reconcile_one(service, &run.cancel).await? {
            Ok(outcome) => {
                run.log(describe_outcome(&outcome));
                report.succeeded.push(outcome);
            }
            Err(err) => {
                if !err.is_cancelled() {
                    run.error(err.to_string());
                }
                report.failed.push(err);
            }
        }
        let failures = report.has_failures();
        let stop = if report.was_cancelled() {
            Some(Stop::Cancelled)
        } else {
            run.should_stop()
        };
        parts.reconcile = Some(report);
        self.finish_with_orphans(run, stop, failures, parts).await
    }

    async fn finish_with_orphans(
        &self,
        run: &ScanRun,
        stop: Option<Stop>,
        service_failures: bool,
        parts: &mut Parts,
    ) -> EngineResult<Outcome> {
        if let Some(stop) = stop {
            return Ok(Outcome::Stopped(stop));
        }
        let w = run.clone();
        let reconciler = self.reconciler.clone();
        let summary = blocking(move || {
            w.set_phase(ScanPhase::UpdatingOrphanedStatus)?;
            Ok(reconciler.recompute_orphans()?)
        })
        .await?;
        run.log(format!(
            "{} of {} files orphaned ({} changed)",
            summary.orphaned, summary.checked, summary.changed
        ));
        parts.orphans = Some(summary);
        Ok(Outcome::Finished { service_failures })
    }

    // --- queries ---

    /// The scan marked `Running`, after reclassifying a stale one.
    ///
    /// A `Running` record that has not reported progress within the
    /// staleness window and does not belong to this process is finalized as
    /// `Interrupted`, so it becomes resumable.
    pub async fn current_scan(&self) -> EngineResult<Option<ScanRecord>> {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let own = self.active.lock().as_ref().and_then(|a| a.id);
        blocking(move || Ok(reclassify_stale(store.as_ref(), &config, own)?)).await
    }

    /// Most recent scans first, with stale scans reclassified.
    pub async fn recent_scans(&self, limit: usize) -> EngineResult<Vec<ScanRecord>> {
        self.current_scan().await?;
        let store = Arc::clone(&self.store);
        blocking(move || Ok(store.recent_scans(limit)?)).await
    }

    pub async fn latest_scan(&self) -> EngineResult<Option<ScanRecord>> {
        Ok(self.recent_scans(1).await?.into_iter().next())
    }

    pub async fn scan_log(&self, id: ScanId) -> EngineResult<Vec<String>> {
        let store = Arc::clone(&self.store);
        blocking(move || Ok(store.scan_log(id)?)).await
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.tracker.snapshot()
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        self.tracker.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.tracker.unsubscribe(id)
    }

    /// Library statistics, cached for the configured TTL.
    pub async fn library_stats(&self) -> EngineResult<Arc<LibraryStats>> {
        if let Some(stats) = self.stats.fresh() {
            return Ok(stats);
        }
        let store = Arc::clone(&self.store);
        let services = self.reconciler.active_services();
        let batch = self.config.checkpoint_batch_size();
        let stats = blocking(move || Ok(LibraryStats::compute(store.as_ref(), &services, batch)?))
            .await?;
        Ok(self.stats.insert(stats))
    }

    pub async fn orphaned_files(&self, limit: Option<usize>) -> EngineResult<Vec<FileRecord>> {
        let mut query = FileQuery::all().orphaned(true);
        query.limit = limit;
        let store = Arc::clone(&self.store);
        blocking(move || Ok(store.list_files(&query)?)).await
    }

    pub async fn hardlinks(&self) -> EngineResult<HardlinkReport> {
        let store = Arc::clone(&self.store);
        blocking(move || {
            let linked = store.list_files(&FileQuery::all().hardlinked_only())?;
            Ok(HardlinkGrouper::new().group(&linked))
        })
        .await
    }

    /// Content duplicates, reusing stored hashes where they cover the work.
    ///
    /// Groups are classified by physical disk when locations are known.
    pub async fn duplicates(&self) -> EngineResult<DuplicateReport> {
        let store = Arc::clone(&self.store);
        let config = DuplicateConfig::from_engine(&self.config);
        blocking(move || {
            let files = store.list_files(&FileQuery::all().min_size(config.min_size))?;
            let mut report = DuplicateDetector::with_config(config).find_duplicates(&files);

            let mut locations = HashMap::new();
            for file in report.groups.iter().flat_map(|g| &g.files) {
                let found = store.disk_locations(file.id)?;
                if !found.is_empty() {
                    locations.insert(file.id, found);
                }
            }
            if !locations.is_empty() {
                report.classify_disks(&locations);
            }
            Ok(report)
        })
        .await
    }

    /// Reported paths that did not match any stored file.
    pub async fn missing_entries(
        &self,
        service: Option<ServiceId>,
    ) -> EngineResult<Vec<ServiceMissingEntry>> {
        let store = Arc::clone(&self.store);
        blocking(move || Ok(store.service_missing(service.as_ref())?)).await
    }

    pub async fn test_services(&self) -> Vec<(ServiceId, ProviderResult<()>)> {
        self.reconciler.test_services().await
    }

    /// Check that `service`'s reported paths translate under `local_prefix`.
    pub async fn validate_mapping(
        &self,
        service: &ServiceId,
        local_prefix: &Path,
    ) -> ProviderResult<MappingValidation> {
        self.reconciler.validate_mapping(service, local_prefix).await
    }
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("roots", &self.config.roots)
            .field("active", &self.active.lock().as_ref().and_then(|a| a.id))
            .finish_non_exhaustive()
    }
}

/// Shared state of one scan, cloned into blocking workers.
#[derive(Clone)]
struct ScanRun {
    id: ScanId,
    started_at: DateTime<Utc>,
    store: Arc<dyn PersistenceGateway>,
    config: Arc<EngineConfig>,
    tracker: Arc<ProgressTracker>,
    record: Arc<Mutex<ScanRecord>>,
    /// Graceful: checked between units of work.
    cancel: CancellationToken,
    /// Immediate: set on force-stop or when the duration ceiling is hit.
    halt: CancellationToken,
}

impl ScanRun {
    fn should_stop(&self) -> Option<Stop> {
        if self.halt.is_cancelled() {
            Some(Stop::Halted)
        } else if self.cancel.is_cancelled() {
            Some(Stop::Cancelled)
        } else {
            None
        }
    }

    fn log(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        self.tracker.log(line);
        if let Err(err) = self.store.append_scan_log(self.id, line) {
            debug!(scan = %self.id, error = %err, "failed to append scan log");
        }
    }

    fn error(&self, message: impl Into<String>) {
        let message = message.into();
        self.record
            .lock()
            .record_error(message.clone(), self.config.max_stored_errors);
        self.tracker.add_error();
        self.log(format!("Error: {message}"));
    }

    fn warn(&self, warning: &ScanWarning) {
        self.error(warning.to_string());
    }

    fn set_phase(&self, phase: ScanPhase) -> StoreResult<()> {
        self.record.lock().current_phase = phase.to_string();
        self.tracker.set_phase(phase.clone());
        self.log(phase.to_string());
        self.checkpoint()
    }

    /// Persist the in-memory record, refreshing `updated_at`.
    fn checkpoint(&self) -> StoreResult<()> {
        let snapshot = {
            let mut record = self.record.lock();
            record.updated_at = Utc::now();
            record.clone()
        };
        self.store.update_scan(&snapshot)
    }

    fn advance(&self, path: &Path) {
        {
            let mut record = self.record.lock();
            record.files_scanned += 1;
            record.last_processed_path = Some(path.to_path_buf());
        }
        self.tracker.advance(1, Some(path.to_path_buf()));
    }

    fn finish(&self, status: ScanStatus) -> StoreResult<ScanRecord> {
        let record = {
            let mut record = self.record.lock();
            record.finish(status, Utc::now());
            record.clone()
        };
        self.store.update_scan(&record)?;
        Ok(record)
    }

    fn observer(&self) -> ReconcileObserver {
        let run = self.clone();
        Arc::new(move |event: &ReconcileEvent| match event {
            ReconcileEvent::Started {
                service,
                index,
                total,
            } => {
                let phase = ScanPhase::CheckingService {
                    service: service.clone(),
                    index: *index,
                    total: *total,
                };
                if let Err(err) = run.set_phase(phase) {
                    warn!(scan = %run.id, error = %err, "failed to checkpoint service phase");
                }
            }
            ReconcileEvent::Fetched { service, reported } => {
                run.log(format!("{service}: {reported} files reported"));
            }
            ReconcileEvent::Finished(outcome) => run.log(describe_outcome(outcome)),
            ReconcileEvent::Failed(_) => {}
        })
    }
}

fn describe_outcome(outcome: &ServiceOutcome) -> String {
    format!(
        "{}: {} matched, {} missing, {} untranslated, {} pruned in {:.1?}",
        outcome.service,
        outcome.matched,
        outcome.missing,
        outcome.untranslated,
        outcome.pruned,
        outcome.elapsed
    )
}

async fn blocking<T, F>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Finalize a stale `Running` scan as `Interrupted`. Returns the scan still
/// legitimately running, if any.
fn reclassify_stale(
    store: &dyn PersistenceGateway,
    config: &EngineConfig,
    own: Option<ScanId>,
) -> StoreResult<Option<ScanRecord>> {
    let Some(mut running) = store.running_scan()? else {
        return Ok(None);
    };
    let now = Utc::now();
    if Some(running.id) == own || !running.is_stale(now, config.staleness_window()) {
        return Ok(Some(running));
    }

    warn!(scan = %running.id, updated_at = %running.updated_at, "reclassifying stale scan as interrupted");
    running.record_error(
        format!("No progress since {}; marked interrupted", running.updated_at),
        config.max_stored_errors,
    );
    running.finish(ScanStatus::Interrupted, now);
    store.update_scan(&running)?;
    store.append_scan_log(running.id, "Scan stopped reporting progress; marked interrupted")?;
    Ok(None)
}

/// The job and cursor for continuing the latest scan.
fn plan_resume(store: &dyn PersistenceGateway) -> EngineResult<(Job, ResumePlan)> {
    let Some(target) = store.last_interrupted_scan()? else {
        return Err(EngineError::NothingToResume);
    };
    // a newer scan supersedes the interrupted one
    let latest = store.recent_scans(1)?;
    if latest.first().is_some_and(|s| s.id != target.id) {
        return Err(EngineError::NothingToResume);
    }
    let job = Job::from_scan_type(&target.scan_type).ok_or(EngineError::NothingToResume)?;

    let mut origin = target.started_at;
    let mut previous = target.resume_from_scan_id;
    while let Some(id) = previous {
        match store.scan(id)? {
            Some(scan) => {
                origin = scan.started_at;
                previous = scan.resume_from_scan_id;
            }
            None => break,
        }
    }

    let cursor = if target.scan_type.walks_filesystem() {
        target.last_processed_path.clone()
    } else {
        None
    };
    Ok((
        job,
        ResumePlan {
            from: target.id,
            cursor,
            sweep_cutoff: origin,
            // each resumed record inherits its predecessors' directories
            unreadable_dirs: target.unreadable_dirs,
        },
    ))
}

struct Walked {
    counts: SyncCounts,
    stats: WalkStats,
    stopped: Option<Stop>,
}

fn walk_roots(
    run: &ScanRun,
    walker: &FileSystemWalker,
    roots: &[PathBuf],
    mode: WalkMode,
    cursor: Option<PathBuf>,
) -> EngineResult<Walked> {
    let roots = walker.prepare_roots(roots)?;

    run.set_phase(ScanPhase::CountingFiles)?;
    let stopped_early = |stop| Walked {
        counts: SyncCounts::default(),
        stats: WalkStats::default(),
        stopped: Some(stop),
    };
    let mut total = 0;
    for root in &roots {
        let mut failure = None;
        let counted = walker.count_files(root, |n| {
            if run.should_stop().is_some() {
                return ControlFlow::Break(());
            }
            // counting a large root must not look stale
            if n % COUNT_HEARTBEAT == 0 {
                if let Err(err) = run.checkpoint() {
                    failure = Some(err);
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        if let Some(err) = failure {
            return Err(err.into());
        }
        match (counted, run.should_stop()) {
            (_, Some(stop)) => return Ok(stopped_early(stop)),
            (Some(counted), None) => total += counted,
            (None, None) => return Ok(stopped_early(Stop::Cancelled)),
        }
    }
    run.tracker.set_total(total);
    run.log(format!("Found {total} files under {} roots", roots.len()));

    run.set_phase(ScanPhase::ScanningFilesystem)?;
    let batch = run.config.checkpoint_batch_size();
    let mut walk = walker.walk(&roots, cursor);
    let mut counts = SyncCounts::default();
    let mut since_checkpoint = 0;
    let mut stopped = None;

    for event in walk.by_ref() {
        if let Some(stop) = run.should_stop() {
            stopped = Some(stop);
            break;
        }
        match event? {
            WalkEvent::Warning(warning) => run.warn(&warning),
            WalkEvent::Unreadable(warning) => {
                run.warn(&warning);
                run.record.lock().unreadable_dirs.push(warning.path);
            }
            WalkEvent::File(file) => {
                counts.record(sync_entry(run.store.as_ref(), &file, mode, Utc::now())?);
                run.advance(&file.path);
                since_checkpoint += 1;
                if since_checkpoint >= batch {
                    run.checkpoint()?;
                    since_checkpoint = 0;
                }
            }
        }
    }
    run.checkpoint()?;

    Ok(Walked {
        counts,
        stats: walk.stats().clone(),
        stopped,
    })
}

fn hash_files(run: &ScanRun, config: DuplicateConfig) -> EngineResult<(Outcome, HashSummary)> {
    run.set_phase(ScanPhase::HashingFiles)?;
    let files = run
        .store
        .list_files(&FileQuery::all().min_size(config.min_size))?;
    let writer = HashWriter::new(run, &files);
    let report = DuplicateDetector::with_config(config).find_duplicates_observed(&files, &writer);

    for warning in &report.warnings {
        run.warn(warning);
    }
    let mut summary = HashSummary {
        hashes_reused: report.hashes_reused,
        bytes_hashed: report.bytes_hashed,
        duplicate_groups: report.groups.len() as u64,
        wasted_bytes: report.total_wasted_space,
        ..HashSummary::default()
    };

    let stop = run.should_stop();
    if stop == Some(Stop::Halted) {
        summary.files_hashed = writer.written();
        return Ok((Outcome::Stopped(Stop::Halted), summary));
    }
    summary.files_hashed = writer.flush()?;
    if let Some(stop) = stop {
        run.log(format!("Hashing stopped after {} files", summary.files_hashed));
        return Ok((Outcome::Stopped(stop), summary));
    }

    run.record.lock().files_scanned = report.files_analyzed;
    run.checkpoint()?;
    run.log(format!(
        "Hashed {} files ({} reused): {} duplicate groups",
        summary.files_hashed, summary.hashes_reused, summary.duplicate_groups
    ));
    Ok((Outcome::Finished { service_failures: false }, summary))
}

/// Persists hashes as size groups finish, one checkpoint per batch.
struct HashWriter<'a> {
    run: &'a ScanRun,
    /// Stored `(hash, level, bytes)` per candidate.
    stored: HashMap<FileId, (Option<ContentHash>, HashLevel, u64)>,
    batch: usize,
    pending: Mutex<Vec<HashedFile>>,
    written: AtomicU64,
    failure: Mutex<Option<StoreError>>,
}

impl<'a> HashWriter<'a> {
    fn new(run: &'a ScanRun, files: &[FileRecord]) -> Self {
        Self {
            run,
            stored: files
                .iter()
                .map(|f| (f.id, (f.content_hash, f.hash_level, f.hash_bytes)))
                .collect(),
            batch: run.config.checkpoint_batch_size(),
            pending: Mutex::new(Vec::new()),
            written: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }

    /// Only a hash over more bytes, or a different hash over the same
    /// bytes, replaces the stored one.
    fn is_upgrade(&self, hashed: &HashedFile) -> bool {
        let Some((hash, level, bytes)) = self.stored.get(&hashed.id) else {
            return false;
        };
        match hashed.bytes.cmp(bytes) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => *hash != Some(hashed.hash) || *level != hashed.level,
            std::cmp::Ordering::Less => false,
        }
    }

    fn write(&self, batch: &[HashedFile]) -> StoreResult<()> {
        for hashed in batch {
            self.run
                .store
                .set_content_hash(hashed.id, hashed.hash, hashed.level, hashed.bytes)?;
        }
        self.written.fetch_add(batch.len() as u64, AtomicOrdering::Relaxed);
        self.run.checkpoint()
    }

    fn written(&self) -> u64 {
        self.written.load(AtomicOrdering::Relaxed)
    }

    /// Write what is still pending. Returns the total written.
    fn flush(&self) -> EngineResult<u64> {
        if let Some(err) = self.failure.lock().take() {
            return Err(err.into());
        }
        let rest = std::mem::take(&mut *self.pending.lock());
        if !rest.is_empty() {
            self.write(&rest)?;
        }
        Ok(self.written())
    }
}

impl HashObserver for HashWriter<'_> {
    fn progress(&self, progress: &HashProgress) {
        self.run.tracker.set_total(progress.total_groups);
        self.run.tracker.set_processed(progress.groups_processed);
    }

    fn hashed(&self, files: &[HashedFile]) {
        self.run.record.lock().files_scanned += files.len() as u64;
        let full = {
            let mut pending = self.pending.lock();
            pending.extend(files.iter().filter(|h| self.is_upgrade(h)).copied());
            if pending.len() >= self.batch {
                std::mem::take(&mut *pending)
            } else {
                Vec::new()
            }
        };
        // a halted scan is already finalized
        if full.is_empty() || self.run.halt.is_cancelled() {
            return;
        }
        if let Err(err) = self.write(&full) {
            warn!(scan = %self.run.id, error = %err, "failed to persist hashes");
            self.failure.lock().get_or_insert(err);
        }
    }

    fn should_stop(&self) -> bool {
        self.run.should_stop().is_some() || self.failure.lock().is_some()
    }
}

fn locate_disks(run: &ScanRun, pool: &DiskPoolConfig) -> EngineResult<(Outcome, u64)> {
    run.set_phase(ScanPhase::LocatingDisks)?;
    let query = FileQuery::all().under(&pool.pool_path);
    run.tracker.set_total(run.store.count_files(&query)?);

    let batch = run.config.checkpoint_batch_size();
    let mut located = 0;
    let mut offset = 0;
    loop {
        let page = run.store.list_files(&query.clone().page(offset, batch))?;
        if page.is_empty() {
            break;
        }
        offset += page.len();

        for file in page {
            if let Some(stop) = run.should_stop() {
                run.checkpoint()?;
                return Ok((Outcome::Stopped(stop), located));
            }
            let Ok(relative) = file.path.strip_prefix(&pool.pool_path) else {
                continue;
            };
            run.store.delete_disk_locations(file.id)?;
            for disk in &pool.disk_paths {
                let candidate = disk.join(relative);
                match std::fs::symlink_metadata(&candidate) {
                    Ok(metadata) if metadata.is_file() => {
                        let device = observe(&candidate, &metadata).device_id;
                        run.store.upsert_disk_location(&FileDiskLocation {
                            file_id: file.id,
                            disk_device_id: device,
                            disk_path: candidate,
                        })?;
                        located += 1;
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        run.warn(&ScanWarning::from_io(&candidate, &err, WarningKind::MetadataError))
                    }
                }
            }
            run.advance(&file.path);
        }
        run.checkpoint()?;
    }

    run.log(format!("Recorded {located} disk locations"));
    Ok((Outcome::Finished { service_failures: false }, located))
}

/// Re-stat every stored record.
fn verify_stored(run: &ScanRun) -> EngineResult<(Option<Stop>, SyncCounts, u64)> {
    run.set_phase(ScanPhase::VerifyingFiles)?;
    run.tracker.set_total(run.store.count_files(&FileQuery::all())?);

    let batch = run.config.checkpoint_batch_size();
    let mut counts = SyncCounts::default();
    let mut deleted = 0;
    let mut offset = 0;
    loop {
        let page = run.store.list_files(&FileQuery::all().page(offset, batch))?;
        if page.is_empty() {
            break;
        }
        for file in page {
            if let Some(stop) = run.should_stop() {
                run.checkpoint()?;
                return Ok((Some(stop), counts, deleted));
            }
            // deleted records shift the listing back
            if verify_one(run, &file.path, &mut counts)? {
                offset += 1;
            } else {
                deleted += 1;
            }
        }
        run.checkpoint()?;
    }
    run.record.lock().deleted_files_count += deleted;
    run.checkpoint()?;
    run.log(format!("Verified {} files, removed {deleted}", counts.total()));
    Ok((None, counts, deleted))
}

fn verify_paths(
    run: &ScanRun,
    paths: &[PathBuf],
) -> EngineResult<(Option<Stop>, SyncCounts, u64)> {
    run.set_phase(ScanPhase::VerifyingFiles)?;
    run.tracker.set_total(paths.len() as u64);

    let mut counts = SyncCounts::default();
    let mut deleted = 0;
    for path in paths {
        if let Some(stop) = run.should_stop() {
            run.checkpoint()?;
            return Ok((Some(stop), counts, deleted));
        }
        if !verify_one(run, path, &mut counts)? {
            deleted += 1;
        }
    }
    run.record.lock().deleted_files_count += deleted;
    run.checkpoint()?;
    Ok((None, counts, deleted))
}

/// Re-stat one path. Returns `false` when its record was removed.
fn verify_one(run: &ScanRun, path: &Path, counts: &mut SyncCounts) -> EngineResult<bool> {
    let kept = match rescan_path(run.store.as_ref(), path, Utc::now())? {
        RescanOutcome::Upserted(outcome) => {
            counts.record(outcome);
            true
        }
        RescanOutcome::Deleted => {
            debug!(path = %path.display(), "removed missing file");
            false
        }
        RescanOutcome::Absent => true,
        RescanOutcome::Failed(warning) => {
            run.warn(&warning);
            true
        }
    };
    run.advance(path);
    Ok(kept)
}

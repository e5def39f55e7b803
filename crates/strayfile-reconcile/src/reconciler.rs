//! Reconciling service-reported files against stored file records.

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strayfile_core::{
    EngineConfig, FileId, FileQuery, PersistenceGateway, ServiceId, ServiceMissingEntry,
    StoreError, StoreResult, UsageRecord, WorkerPool,
};

use crate::provider::{FetchContext, FileProvider, ProviderError, ProviderRegistry, ProviderResult, ReportedFile};
use crate::translator::{PathTranslator, SAMPLE_LIMIT, SampleMatch, resolve_local};

/// Missing entries are written in chunks of this size.
const MISSING_CHUNK: usize = 500;

/// Per-service progress notifications.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    Started {
        service: ServiceId,
        index: usize,
        total: usize,
    },
    Fetched {
        service: ServiceId,
        reported: usize,
    },
    Finished(ServiceOutcome),
    Failed(ProviderError),
}

/// Callback receiving [`ReconcileEvent`]s from concurrent service tasks.
pub type ReconcileObserver = Arc<dyn Fn(&ReconcileEvent) + Send + Sync>;

/// Result of reconciling one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub service: ServiceId,
    pub reported: u64,
    /// Reported files matched to a stored record.
    pub matched: u64,
    /// Translated files with no stored record.
    pub missing: u64,
    /// Reported files no rule could translate.
    pub untranslated: u64,
    /// Stale usages deleted after the fetch.
    pub pruned: u64,
    pub elapsed: Duration,
}

/// Result of reconciling every active service.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub succeeded: Vec<ServiceOutcome>,
    pub failed: Vec<ProviderError>,
    /// Service tasks that panicked.
    pub aborted: usize,
    /// Usages removed for services disabled in config.
    pub retired: u64,
}

impl ReconcileReport {
    pub fn has_failures(&self) -> bool {
        self.aborted > 0 || self.failed.iter().any(|e| !e.is_cancelled())
    }

    pub fn was_cancelled(&self) -> bool {
        self.failed.iter().any(ProviderError::is_cancelled)
    }

    pub fn total_matched(&self) -> u64 {
        self.succeeded.iter().map(|s| s.matched).sum()
    }
}

/// Outcome of recomputing orphan flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanSummary {
    pub checked: u64,
    pub orphaned: u64,
    /// Records whose flag flipped.
    pub changed: u64,
}

/// Outcome of a mapping check for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingValidation {
    pub service: ServiceId,
    /// Container prefixes that map onto the local prefix.
    pub container_prefixes: Vec<String>,
    /// Number of reported paths examined.
    pub sampled: usize,
    pub found: Option<SampleMatch>,
}

impl MappingValidation {
    pub fn is_valid(&self) -> bool {
        self.found.is_some()
    }
}

/// Errors that end one service's pass.
enum ServiceError {
    Provider(ProviderError),
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Fetches every active service's files and writes usage records.
#[derive(Clone)]
pub struct ServiceReconciler {
    store: Arc<dyn PersistenceGateway>,
    registry: Arc<ProviderRegistry>,
    translator: Arc<PathTranslator>,
    config: Arc<EngineConfig>,
}

impl ServiceReconciler {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        registry: Arc<ProviderRegistry>,
        translator: Arc<PathTranslator>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            translator,
            config,
        }
    }

    pub fn translator(&self) -> &Arc<PathTranslator> {
        &self.translator
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Services this reconciler will visit.
    pub fn active_services(&self) -> Vec<ServiceId> {
        self.registry.active(&self.config)
    }

    /// Reconcile every active service concurrently.
    ///
    /// A failing service is reported in [`ReconcileReport::failed`] and does
    /// not stop the others. Only a store error is returned as `Err`.
    pub async fn reconcile_all(
        &self,
        cancel: &CancellationToken,
        observer: Option<ReconcileObserver>,
    ) -> StoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for service in self.registry.disabled(&self.config) {
            let removed = self.retire_service(&service).await?;
            report.retired += removed;
        }

        let services = self.active_services();
        let total = services.len();
        info!(services = total, "reconciling services");

        let mut pool: WorkerPool<ServiceOutcome, ServiceError> = WorkerPool::new(total);
        for (index, service) in services.into_iter().enumerate() {
            let this = self.clone();
            let cancel = cancel.clone();
            let observer = observer.clone();
            pool.submit(async move {
                notify(&observer, &ReconcileEvent::Started {
                    service: service.clone(),
                    index: index + 1,
                    total,
                });
                let result = this.reconcile_service(&service, cancel, observer.as_ref()).await;
                match &result {
                    Ok(outcome) => notify(&observer, &ReconcileEvent::Finished(outcome.clone())),
                    Err(ServiceError::Provider(err)) => notify(&observer, &ReconcileEvent::Failed(err.clone())),
                    Err(ServiceError::Store(_)) => {}
                }
                result
            })
            .await;
        }

        let results = pool.join_all().await;
        let mut store_error = None;
        for failure in results.failed {
            match failure {
                ServiceError::Provider(err) => {
                    warn!(service = %err.service(), error = %err, "service reconciliation failed");
                    report.failed.push(err);
                }
                ServiceError::Store(err) => store_error = Some(err),
            }
        }
        if let Some(err) = store_error {
            return Err(err);
        }
        report.aborted = results.panicked;
        report.succeeded = results.completed;
        report.succeeded.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(report)
    }

    /// Reconcile a single service.
    pub async fn reconcile_one(
        &self,
        service: &ServiceId,
        cancel: &CancellationToken,
    ) -> StoreResult<Result<ServiceOutcome, ProviderError>> {
        match self.reconcile_service(service, cancel.clone(), None).await {
            Ok(outcome) => Ok(Ok(outcome)),
            Err(ServiceError::Provider(err)) => Ok(Err(err)),
            Err(ServiceError::Store(err)) => Err(err),
        }
    }

    async fn reconcile_service(
        &self,
        service: &ServiceId,
        cancel: CancellationToken,
        observer: Option<&ReconcileObserver>,
    ) -> Result<ServiceOutcome, ServiceError> {
        let started = Instant::now();
        let provider = self.provider(service)?;
        let ctx = FetchContext::new(service.clone(), &self.config, cancel.clone());

        let limit = self.config.bulk_timeout(service);
        let files = match tokio::time::timeout(limit, provider.get_all_files(&ctx)).await {
            Ok(Ok(files)) => files,
            Ok(Err(err)) => return Err(ServiceError::Provider(err)),
            Err(_) => return Err(ServiceError::Provider(ProviderError::timeout(service, limit))),
        };
        debug!(service = %service, reported = files.len(), "fetched reported files");
        if let Some(observer) = observer {
            observer(&ReconcileEvent::Fetched {
                service: service.clone(),
                reported: files.len(),
            });
        }

        let this = self.clone();
        let svc = service.clone();
        let mut outcome = tokio::task::spawn_blocking(move || this.apply_reported(&svc, files, &cancel))
            .await
            .map_err(|e| {
                ServiceError::Provider(ProviderError::Other {
                    service: service.clone(),
                    message: e.to_string(),
                })
            })??;
        outcome.elapsed = started.elapsed();
        info!(
            service = %service,
            matched = outcome.matched,
            missing = outcome.missing,
            untranslated = outcome.untranslated,
            pruned = outcome.pruned,
            "service reconciled"
        );
        Ok(outcome)
    }

    /// Write usages for reported files, record misses and prune stale usages.
    fn apply_reported(
        &self,
        service: &ServiceId,
        files: Vec<ReportedFile>,
        cancel: &CancellationToken,
    ) -> Result<ServiceOutcome, ServiceError> {
        let mut outcome = ServiceOutcome {
            service: service.clone(),
            reported: files.len() as u64,
            matched: 0,
            missing: 0,
            untranslated: 0,
            pruned: 0,
            elapsed: Duration::ZERO,
        };
        let mut keep: HashSet<FileId> = HashSet::with_capacity(files.len());
        let mut missing: Vec<ServiceMissingEntry> = Vec::new();
        let now = Utc::now();

        for file in files {
            if cancel.is_cancelled() {
                return Err(ServiceError::Provider(ProviderError::Cancelled {
                    service: service.clone(),
                }));
            }

            let Some(translated) = self.translator.translate(service, &file.reported_path) else {
                outcome.untranslated += 1;
                missing.push(missing_entry(service, &file, None, now));
                continue;
            };

            match self.store.file_by_path(&translated)? {
                Some(record) => {
                    self.store.upsert_usage(&UsageRecord {
                        file_id: record.id,
                        service: service.clone(),
                        reference_path: file.reported_path,
                        metadata: file.metadata,
                    })?;
                    keep.insert(record.id);
                    outcome.matched += 1;
                }
                None => {
                    outcome.missing += 1;
                    missing.push(missing_entry(service, &file, Some(translated), now));
                }
            }

            if missing.len() >= MISSING_CHUNK {
                self.store.record_service_missing(&missing)?;
                missing.clear();
            }
        }

        if !missing.is_empty() {
            self.store.record_service_missing(&missing)?;
        }
        outcome.pruned = self.store.prune_usages(service, &keep)?;
        Ok(outcome)
    }

    async fn retire_service(&self, service: &ServiceId) -> StoreResult<u64> {
        let store = Arc::clone(&self.store);
        let svc = service.clone();
        let removed = tokio::task::spawn_blocking(move || store.prune_usages(&svc, &HashSet::new()))
            .await
            .map_err(|e| StoreError::Unavailable {
                message: e.to_string(),
            })??;
        if removed > 0 {
            info!(service = %service, removed, "removed usages of disabled service");
        }
        Ok(removed)
    }

    /// Set `is_orphaned` on every record: orphaned iff it has no usages.
    ///
    /// Pages through the store in checkpoint-sized batches; blocking.
    pub fn recompute_orphans(&self) -> StoreResult<OrphanSummary> {
        let batch = self.config.checkpoint_batch_size();
        let mut summary = OrphanSummary::default();
        let mut offset = 0;
        loop {
            let page = self.store.list_files(&FileQuery::all().page(offset, batch))?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            let ids: Vec<FileId> = page.iter().map(|f| f.id).collect();
            let counts = self.store.usage_counts(&ids)?;
            let mut updates = Vec::new();
            for file in &page {
                let orphaned = counts.get(&file.id).copied().unwrap_or(0) == 0;
                if orphaned {
                    summary.orphaned += 1;
                }
                if orphaned != file.is_orphaned {
                    updates.push((file.id, orphaned));
                }
            }
            summary.checked += page.len() as u64;
            summary.changed += updates.len() as u64;
            if !updates.is_empty() {
                self.store.set_orphaned(&updates)?;
            }
        }
        info!(
            checked = summary.checked,
            orphaned = summary.orphaned,
            changed = summary.changed,
            "orphan status updated"
        );
        Ok(summary)
    }

    /// Call [`FileProvider::test`] on every active service concurrently.
    pub async fn test_services(&self) -> Vec<(ServiceId, ProviderResult<()>)> {
        let services = self.active_services();
        let mut pool: WorkerPool<(ServiceId, ProviderResult<()>), Infallible> = WorkerPool::new(services.len());
        for service in services {
            let provider = self.provider(&service);
            let limit = self.config.api_timeout(&service);
            pool.submit(async move {
                let result = match provider {
                    Ok(provider) => match tokio::time::timeout(limit, provider.test()).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::timeout(&service, limit)),
                    },
                    Err(err) => Err(err),
                };
                Ok((service, result))
            })
            .await;
        }
        let mut results = pool.join_all().await.completed;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Check that `service`'s paths under `local_prefix` translate.
    ///
    /// Uses [`FileProvider::get_sample_file`] when supported, otherwise a
    /// bounded slice of the full listing.
    pub async fn validate_mapping(
        &self,
        service: &ServiceId,
        local_prefix: &Path,
    ) -> ProviderResult<MappingValidation> {
        let provider = self.provider(service)?;
        let local_prefix = &resolve_local(local_prefix);
        let mut container_prefixes = self.translator.reverse(service, local_prefix);
        if container_prefixes.is_empty() {
            container_prefixes.push(local_prefix.to_string_lossy().into_owned());
        }

        let samples = if provider.supports_sampling() {
            let limit = self.config.api_timeout(service);
            let mut samples = Vec::new();
            for prefix in &container_prefixes {
                match tokio::time::timeout(limit, provider.get_sample_file(prefix)).await {
                    Ok(Ok(Some(path))) => samples.push(path),
                    Ok(Ok(None)) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(ProviderError::timeout(service, limit)),
                }
            }
            samples
        } else {
            let ctx = FetchContext::new(service.clone(), &self.config, CancellationToken::new());
            let limit = self.config.bulk_timeout(service);
            let files = tokio::time::timeout(limit, provider.get_all_files(&ctx))
                .await
                .map_err(|_| ProviderError::timeout(service, limit))??;
            let under: Vec<String> = files
                .iter()
                .filter(|f| container_prefixes.iter().any(|p| f.reported_path.starts_with(p.as_str())))
                .take(SAMPLE_LIMIT)
                .map(|f| f.reported_path.clone())
                .collect();
            if under.is_empty() {
                files.into_iter().take(SAMPLE_LIMIT).map(|f| f.reported_path).collect()
            } else {
                under
            }
        };

        let found = self.translator.sample_match(service, &samples, local_prefix);
        Ok(MappingValidation {
            service: service.clone(),
            container_prefixes,
            sampled: samples.len().min(SAMPLE_LIMIT),
            found,
        })
    }

    fn provider(&self, service: &ServiceId) -> ProviderResult<Arc<dyn FileProvider>> {
        self.registry
            .get(service)
            .ok_or_else(|| ProviderError::NotRegistered {
                service: service.clone(),
            })
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

fn notify(observer: &Option<ReconcileObserver>, event: &ReconcileEvent) {
    if let Some(observer) = observer {
        observer(event);
    }
}

fn missing_entry(
    service: &ServiceId,
    file: &ReportedFile,
    translated: Option<PathBuf>,
    now: chrono::DateTime<Utc>,
) -> ServiceMissingEntry {
    ServiceMissingEntry {
        service: service.clone(),
        reported_path: file.reported_path.clone(),
        translated_path: translated,
        size: file.size,
        recorded_at: now,
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use strayfile_core::{
    EngineConfig, FileQuery, MemoryStore, ObservedFile, PathMapping, PersistenceGateway,
    ServiceConfig, ServiceId,
};
use strayfile_reconcile::{
    BoxFuture, FetchContext, FileProvider, PathTranslator, ProviderError, ProviderRegistry,
    ProviderResult, ReconcileEvent, ReconcileObserver, ReportedFile, ServiceReconciler,
};
use tokio_util::sync::CancellationToken;

struct StaticProvider {
    id: ServiceId,
    files: Vec<String>,
    sample: Option<String>,
}

impl StaticProvider {
    fn new(id: &str, files: &[&str]) -> Self {
        Self {
            id: id.into(),
            files: files.iter().map(|s| s.to_string()).collect(),
            sample: None,
        }
    }
}

impl FileProvider for StaticProvider {
    fn id(&self) -> &ServiceId {
        &self.id
    }

    fn test<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn get_all_files<'a>(&'a self, _ctx: &'a FetchContext) -> BoxFuture<'a, ProviderResult<Vec<ReportedFile>>> {
        Box::pin(async move { Ok(self.files.iter().map(ReportedFile::new).collect()) })
    }

    fn supports_sampling(&self) -> bool {
        self.sample.is_some()
    }

    fn get_sample_file<'a>(&'a self, _prefix: &'a str) -> BoxFuture<'a, ProviderResult<Option<String>>> {
        Box::pin(async move { Ok(self.sample.clone()) })
    }
}

struct FailingProvider(ServiceId);

impl FileProvider for FailingProvider {
    fn id(&self) -> &ServiceId {
        &self.0
    }

    fn test<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            Err(ProviderError::Auth {
                service: self.0.clone(),
                message: "401".into(),
            })
        })
    }

    fn get_all_files<'a>(&'a self, _ctx: &'a FetchContext) -> BoxFuture<'a, ProviderResult<Vec<ReportedFile>>> {
        Box::pin(async move {
            Err(ProviderError::Malformed {
                service: self.0.clone(),
                message: "unexpected end of JSON".into(),
            })
        })
    }
}

struct SlowProvider(ServiceId);

impl FileProvider for SlowProvider {
    fn id(&self) -> &ServiceId {
        &self.0
    }

    fn test<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
    }

    fn get_all_files<'a>(&'a self, _ctx: &'a FetchContext) -> BoxFuture<'a, ProviderResult<Vec<ReportedFile>>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        })
    }
}

fn boxed(provider: impl FileProvider + 'static) -> Arc<dyn FileProvider> {
    Arc::new(provider)
}

fn observed(path: &str) -> ObservedFile {
    ObservedFile {
        path: PathBuf::from(path),
        size: 100,
        inode: path.len() as u64,
        device_id: 1,
        modified: DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
    }
}

fn setup(
    paths: &[&str],
    providers: Vec<Arc<dyn FileProvider>>,
    configure: impl FnOnce(&mut EngineConfig),
) -> (Arc<MemoryStore>, ServiceReconciler) {
    let store = Arc::new(MemoryStore::new());
    for path in paths {
        store.upsert_file(&observed(path), Utc::now()).unwrap();
    }
    let mut config = EngineConfig::new(["/m"]);
    config.api_timeout_secs = 1;
    config.slow_timeout_multiplier = 1;
    config.passthrough_unmapped = false;
    configure(&mut config);

    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider);
    }
    let translator = Arc::new(PathTranslator::from_config(&config));
    let reconciler = ServiceReconciler::new(
        store.clone(),
        Arc::new(registry),
        translator,
        Arc::new(config),
    );
    (store, reconciler)
}

#[tokio::test]
async fn test_reported_file_is_used_and_unreported_is_orphaned() {
    let (store, reconciler) = setup(
        &["/m/a.mkv", "/m/b.mkv"],
        vec![boxed(StaticProvider::new("radarr", &["/srv/a.mkv"]))],
        |c| c.path_mappings = vec![PathMapping::global("/srv", "/m")],
    );

    let report = reconciler
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(!report.has_failures());
    assert_eq!(report.total_matched(), 1);

    let summary = reconciler.recompute_orphans().unwrap();
    assert_eq!(summary.checked, 2);
    assert_eq!(summary.orphaned, 1);

    let a = store.file_by_path(Path::new("/m/a.mkv")).unwrap().unwrap();
    let b = store.file_by_path(Path::new("/m/b.mkv")).unwrap().unwrap();
    assert!(!a.is_orphaned);
    assert!(b.is_orphaned);

    let usages = store.usages_for_file(a.id).unwrap();
    assert_eq!(usages[0].reference_path, "/srv/a.mkv");
}

#[tokio::test]
async fn test_failing_service_is_isolated() {
    let (store, reconciler) = setup(
        &["/m/a.mkv", "/m/b.mkv"],
        vec![
            boxed(FailingProvider("plex".into())),
            boxed(StaticProvider::new("sonarr", &["/m/b.mkv"])),
        ],
        |c| c.passthrough_unmapped = true,
    );

    let report = reconciler
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(report.has_failures());
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0], ProviderError::Malformed { .. }));
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].matched, 1);

    reconciler.recompute_orphans().unwrap();
    let orphans = store.list_files(&FileQuery::all().orphaned(true)).unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].path, Path::new("/m/a.mkv"));
}

#[tokio::test]
async fn test_slow_service_times_out() {
    let (_store, reconciler) = setup(&[], vec![boxed(SlowProvider("bazarr".into()))], |_| {});

    let report = reconciler
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(matches!(report.failed[0], ProviderError::Timeout { .. }));
}

#[tokio::test]
async fn test_configured_service_without_provider_fails() {
    let (_store, reconciler) = setup(&[], vec![], |c| c.services = vec![ServiceConfig::new("lidarr")]);

    let report = reconciler
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(matches!(report.failed[0], ProviderError::NotRegistered { .. }));
}

#[tokio::test]
async fn test_missing_and_untranslated_entries_are_recorded() {
    let (store, reconciler) = setup(
        &["/m/a.mkv"],
        vec![boxed(StaticProvider::new(
            "radarr",
            &["/srv/a.mkv", "/srv/gone.mkv", "C:\\movies\\x.mkv"],
        ))],
        |c| c.path_mappings = vec![PathMapping::global("/srv", "/m")],
    );

    let report = reconciler
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    let outcome = &report.succeeded[0];
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.missing, 1);
    assert_eq!(outcome.untranslated, 1);

    let missing = store.service_missing(Some(&"radarr".into())).unwrap();
    assert_eq!(missing.len(), 2);
    assert!(missing
        .iter()
        .any(|m| m.translated_path.as_deref() == Some(Path::new("/m/gone.mkv"))));
    assert!(missing.iter().any(|m| m.translated_path.is_none()));
}

#[tokio::test]
async fn test_usages_no_longer_reported_are_pruned() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_file(&observed("/m/a.mkv"), Utc::now()).unwrap();
    store.upsert_file(&observed("/m/b.mkv"), Utc::now()).unwrap();
    let config = Arc::new(EngineConfig::new(["/m"]));
    let translator = Arc::new(PathTranslator::from_config(&config));

    let run = |files: &'static [&'static str]| {
        let mut registry = ProviderRegistry::new();
        registry.register(boxed(StaticProvider::new("sonarr", files)));
        ServiceReconciler::new(store.clone(), Arc::new(registry), translator.clone(), config.clone())
    };

    run(&["/m/a.mkv", "/m/b.mkv"])
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    let report = run(&["/m/a.mkv"])
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(report.succeeded[0].pruned, 1);

    let b = store.file_by_path(Path::new("/m/b.mkv")).unwrap().unwrap();
    assert!(store.usages_for_file(b.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_service_usages_are_retired() {
    let (store, reconciler) = setup(
        &["/m/a.mkv"],
        vec![boxed(StaticProvider::new("plex", &["/m/a.mkv"]))],
        |c| c.passthrough_unmapped = true,
    );
    reconciler
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();

    let mut config = EngineConfig::new(["/m"]);
    let mut plex = ServiceConfig::new("plex");
    plex.enabled = false;
    config.services = vec![plex];
    let disabled = ServiceReconciler::new(
        store.clone(),
        reconciler.registry().clone(),
        reconciler.translator().clone(),
        Arc::new(config),
    );
    let report = disabled
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(report.retired, 1);
    assert!(report.succeeded.is_empty());

    disabled.recompute_orphans().unwrap();
    assert_eq!(store.count_files(&FileQuery::all().orphaned(true)).unwrap(), 1);
}

#[tokio::test]
async fn test_cancelled_pass_does_not_prune() {
    let (store, reconciler) = setup(
        &["/m/a.mkv"],
        vec![boxed(StaticProvider::new("sonarr", &["/m/a.mkv"]))],
        |c| c.passthrough_unmapped = true,
    );
    reconciler
        .reconcile_all(&CancellationToken::new(), None)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = reconciler.reconcile_all(&cancel, None).await.unwrap();
    assert!(report.was_cancelled());
    assert!(!report.has_failures());

    let a = store.file_by_path(Path::new("/m/a.mkv")).unwrap().unwrap();
    assert_eq!(store.usages_for_file(a.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_observer_sees_each_service() {
    let (_store, reconciler) = setup(
        &[],
        vec![
            boxed(StaticProvider::new("radarr", &[])),
            boxed(StaticProvider::new("sonarr", &[])),
            boxed(FailingProvider("plex".into())),
        ],
        |_| {},
    );
    let started = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(Mutex::new(Vec::new()));
    let observer: ReconcileObserver = {
        let started = started.clone();
        let failed = failed.clone();
        Arc::new(move |event: &ReconcileEvent| match event {
            ReconcileEvent::Started { total, .. } => {
                assert_eq!(*total, 3);
                started.fetch_add(1, Ordering::SeqCst);
            }
            ReconcileEvent::Failed(err) => failed.lock().push(err.service().clone()),
            _ => {}
        })
    };

    reconciler
        .reconcile_all(&CancellationToken::new(), Some(observer))
        .await
        .unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(*failed.lock(), vec![ServiceId::from("plex")]);
}

#[tokio::test]
async fn test_connectivity_results_per_service() {
    let (_store, reconciler) = setup(
        &[],
        vec![
            boxed(StaticProvider::new("radarr", &[])),
            boxed(FailingProvider("plex".into())),
            boxed(SlowProvider("bazarr".into())),
        ],
        |_| {},
    );
    let results = reconciler.test_services().await;
    let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["bazarr", "plex", "radarr"]);
    assert!(matches!(results[0].1, Err(ProviderError::Timeout { .. })));
    assert!(matches!(results[1].1, Err(ProviderError::Auth { .. })));
    assert!(results[2].1.is_ok());
}

#[tokio::test]
async fn test_validate_mapping_with_sampling() {
    let mut provider = StaticProvider::new("radarr", &[]);
    provider.sample = Some("/movies/Heat (1995)/heat.mkv".into());
    let (_store, reconciler) = setup(&[], vec![boxed(provider)], |c| {
        c.path_mappings = vec![PathMapping::for_service("radarr", "/movies", "/mnt/media/movies")]
    });

    let validation = reconciler
        .validate_mapping(&"radarr".into(), Path::new("/mnt/media/movies"))
        .await
        .unwrap();
    assert_eq!(validation.container_prefixes, vec!["/movies".to_string()]);
    assert!(validation.is_valid());
    assert_eq!(
        validation.found.unwrap().translated,
        PathBuf::from("/mnt/media/movies/Heat (1995)/heat.mkv")
    );
}

#[tokio::test]
async fn test_validate_mapping_falls_back_to_listing() {
    let (_store, reconciler) = setup(
        &[],
        vec![boxed(StaticProvider::new("sonarr", &["/other/x.mkv", "/tv/show/e1.mkv"]))],
        |c| c.path_mappings = vec![PathMapping::global("/tv", "/mnt/tv")],
    );

    let good = reconciler
        .validate_mapping(&"sonarr".into(), Path::new("/mnt/tv"))
        .await
        .unwrap();
    assert!(good.is_valid());
    assert_eq!(good.sampled, 1);

    let bad = reconciler
        .validate_mapping(&"sonarr".into(), Path::new("/mnt/elsewhere"))
        .await
        .unwrap();
    assert!(!bad.is_valid());
}

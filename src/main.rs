//! strayfile - find orphaned, hardlinked and duplicated media files.
//!
//! Usage:
//!   strayfile scan               Full scan and service reconciliation
//!   strayfile scan -t incremental
//!   strayfile resume             Continue an interrupted or cancelled scan
//!   strayfile status             Recent scans and library statistics
//!   strayfile orphans            Files no service references
//!   strayfile hardlinks          Hardlink groups and space saved
//!   strayfile duplicates         Content duplicates
//!   strayfile test               Check every configured service

mod manifest;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, eyre};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use strayfile_analyze::{DuplicateReport, HardlinkReport};
use strayfile_core::{EngineConfig, FileRecord, MemoryStore, PersistenceGateway, ScanRecord, ServiceId};
use strayfile_engine::{EngineResult, LibraryStats, ScanHandle, ScanOrchestrator, ScanRequest, ScanSummary};

#[derive(Parser)]
#[command(
    name = "strayfile",
    version,
    about = "Find orphaned, hardlinked and duplicated files in a media library",
    long_about = "strayfile walks your media roots, asks each configured service which \
                  files it uses, and reports the files nobody references.\n\n\
                  Services are read from manifest files listing one path per line; \
                  set a service's `endpoint` to its manifest path."
)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(short, long, global = true, default_value = "strayfile.json")]
    config: PathBuf,

    /// Store snapshot (JSON), created on first scan
    #[arg(short, long, global = true, default_value = "strayfile-store.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scan
    Scan {
        /// Kind of scan
        #[arg(short = 't', long = "type", default_value = "full")]
        kind: ScanKind,

        /// Service to reconcile (with `--type service`)
        #[arg(long)]
        service: Option<String>,

        /// Paths to re-stat (with `--type rescan`)
        paths: Vec<PathBuf>,
    },

    /// Resume the most recent interrupted or cancelled scan
    Resume,

    /// Show recent scans and library statistics
    Status {
        /// Number of scans to list
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,

        /// Print the log of this scan instead
        #[arg(long)]
        log: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List orphaned files
    Orphans {
        /// Maximum number of files to list
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List hardlink groups
    Hardlinks {
        /// Maximum number of groups to show
        #[arg(short = 'n', long, default_value = "20")]
        top: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Find duplicate files among stored records
    Duplicates {
        /// Minimum file size to consider (e.g., "1KB", "1MB")
        #[arg(short, long)]
        min_size: Option<String>,

        /// Maximum number of duplicate groups to show
        #[arg(short = 'n', long, default_value = "20")]
        top: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Test connectivity of every configured service
    Test {
        /// Also check that SERVICE=LOCAL_PREFIX has a working path mapping
        #[arg(long, value_name = "SERVICE=LOCAL_PREFIX")]
        mapping: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScanKind {
    Full,
    Incremental,
    Service,
    Hash,
    Disks,
    Cleanup,
    Rescan,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_logging();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    if let Command::Duplicates {
        min_size: Some(min_size),
        ..
    } = &cli.command
    {
        config.min_duplicate_size = parse_size(min_size)?;
    }

    let base = cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let registry = manifest::registry_from_config(&config, &base);

    let store = Arc::new(
        MemoryStore::open(&cli.store)
            .with_context(|| format!("Failed to open store {}", cli.store.display()))?,
    );
    let gateway: Arc<dyn PersistenceGateway> = store.clone();
    let engine = Arc::new(
        ScanOrchestrator::new(gateway, Arc::new(config), Arc::new(registry))
            .context("Invalid configuration")?,
    );

    match cli.command {
        Command::Scan {
            kind,
            service,
            paths,
        } => {
            let request = scan_request(kind, service, paths)?;
            run_scan(&engine, request).await?;
            save(&store, &cli.store)?;
        }
        Command::Resume => {
            run_scan(&engine, ScanRequest::Resume).await?;
            save(&store, &cli.store)?;
        }
        Command::Status { limit, log, format } => {
            run_status(&engine, limit, log, format).await?;
            // Stale scans may have been reclassified.
            save(&store, &cli.store)?;
        }
        Command::Orphans { limit, format } => {
            let orphans = engine.orphaned_files(limit).await?;
            print_orphans(&orphans, format)?;
        }
        Command::Hardlinks { top, format } => {
            let report = engine.hardlinks().await?;
            print_hardlinks(&report, top, format)?;
        }
        Command::Duplicates { top, format, .. } => {
            eprintln!("Finding duplicates...");
            let report = engine.duplicates().await?;
            print_duplicates(&report, top, format)?;
        }
        Command::Test { mapping } => {
            run_test(&engine, mapping.as_deref()).await?;
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strayfile=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: EngineConfig = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config.validate().map_err(|e| eyre!("Invalid configuration: {e}"))?;
    Ok(config)
}

fn save(store: &MemoryStore, path: &Path) -> Result<()> {
    store
        .save(path)
        .with_context(|| format!("Failed to save store {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Saved store snapshot");
    Ok(())
}

fn scan_request(kind: ScanKind, service: Option<String>, paths: Vec<PathBuf>) -> Result<ScanRequest> {
    Ok(match kind {
        ScanKind::Full => ScanRequest::Full,
        ScanKind::Incremental => ScanRequest::Incremental,
        ScanKind::Service => {
            let service = service.ok_or_else(|| eyre!("--service is required with --type service"))?;
            ScanRequest::ServiceUpdate(ServiceId::from(service.as_str()))
        }
        ScanKind::Hash => ScanRequest::HashScan,
        ScanKind::Disks => ScanRequest::DiskLocation,
        ScanKind::Cleanup => ScanRequest::Cleanup,
        ScanKind::Rescan => {
            if paths.is_empty() {
                return Err(eyre!("At least one path is required with --type rescan"));
            }
            ScanRequest::FileRescan(paths)
        }
    })
}

/// Start a scan, stream its log to stderr and print the summary.
async fn run_scan(engine: &Arc<ScanOrchestrator>, request: ScanRequest) -> Result<()> {
    let (subscriber, mut lines) = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            eprintln!("{line}");
        }
    });

    let result = match engine.start(request).await {
        Ok(handle) => wait_interruptible(engine, handle, tokio::signal::ctrl_c).await,
        Err(e) => Err(e),
    };
    engine.unsubscribe(subscriber);
    let _ = printer.await;

    let summary = result.context("Scan failed")?;
    print_summary(&summary);
    Ok(())
}

/// Wait for a scan to finish. The first interrupt cancels it, the second
/// force-stops it.
async fn wait_interruptible<F>(
    engine: &ScanOrchestrator,
    handle: ScanHandle,
    mut interrupt: impl FnMut() -> F,
) -> EngineResult<ScanSummary>
where
    F: Future<Output = std::io::Result<()>>,
{
    let wait = handle.wait();
    tokio::pin!(wait);
    let mut cancelled = false;
    loop {
        tokio::select! {
            result = &mut wait => return result,
            signal = interrupt() => {
                if let Err(e) = signal {
                    tracing::warn!("Cannot listen for Ctrl-C: {e}");
                    return (&mut wait).await;
                }
                if cancelled {
                    eprintln!("Stopping scan now");
                    engine.force_stop();
                    return (&mut wait).await;
                }
                eprintln!("Cancelling scan, press Ctrl-C again to stop immediately");
                engine.cancel();
                cancelled = true;
            }
        }
    }
}

fn print_summary(summary: &ScanSummary) {
    let scan = &summary.scan;

    println!();
    println!("{}", "─".repeat(70));
    println!(" Scan #{} ({}) - {}", scan.id, scan.scan_type, scan.status);
    println!("{}", "─".repeat(70));
    if let Some(elapsed) = scan
        .completed_at
        .map(|done| (done - scan.started_at).num_milliseconds() as f64 / 1000.0)
    {
        println!(" Finished in {elapsed:.2}s");
    }
    if let Some(from) = scan.resume_from_scan_id {
        println!(" Resumed from scan #{from}");
    }
    println!(" {} files scanned", scan.files_scanned);

    let sync = &summary.sync;
    if sync.inserted + sync.updated + sync.verified > 0 {
        println!(
            " {} new, {} updated, {} unchanged",
            sync.inserted, sync.updated, sync.verified
        );
    }
    if summary.deleted > 0 {
        println!(" {} records removed for deleted files", summary.deleted);
    }
    if let Some(report) = &summary.reconcile {
        for outcome in &report.succeeded {
            println!(
                " {}: {} reported, {} matched, {} missing, {} untranslated",
                outcome.service, outcome.reported, outcome.matched, outcome.missing, outcome.untranslated
            );
        }
        for error in &report.failed {
            println!(" {error}");
        }
    }
    if let Some(orphans) = &summary.orphans {
        println!(" {} of {} files orphaned", orphans.orphaned, orphans.checked);
    }
    if let Some(hashing) = &summary.hashing {
        println!(
            " {} files hashed ({}), {} reused",
            hashing.files_hashed,
            format_size(hashing.bytes_hashed),
            hashing.hashes_reused
        );
        println!(
            " {} duplicate groups, {} wasted",
            hashing.duplicate_groups,
            format_size(hashing.wasted_bytes)
        );
    }
    if summary.disk_locations > 0 {
        println!(" {} disk locations recorded", summary.disk_locations);
    }
    if scan.error_count > 0 {
        println!();
        println!(" {} error(s):", scan.error_count);
        for error in &scan.errors {
            println!("   {error}");
        }
    }
    println!();
}

#[derive(Serialize)]
struct StatusReport<'a> {
    scans: &'a [ScanRecord],
    stats: &'a LibraryStats,
}

async fn run_status(
    engine: &ScanOrchestrator,
    limit: usize,
    log: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    if let Some(id) = log {
        for line in engine.scan_log(strayfile_core::ScanId(id)).await? {
            println!("{line}");
        }
        return Ok(());
    }

    let scans = engine.recent_scans(limit).await?;
    let stats = engine.library_stats().await?;

    match format {
        OutputFormat::Text => {
            println!();
            println!("{}", "─".repeat(70));
            println!(" Library");
            println!("{}", "─".repeat(70));
            println!(
                " {} files, {}",
                stats.total_files,
                format_size(stats.total_bytes)
            );
            println!(
                " {} orphaned ({})",
                stats.orphaned_files,
                format_size(stats.orphaned_bytes)
            );
            println!(
                " {} hardlink groups saving {}",
                stats.hardlink_groups,
                format_size(stats.hardlink_savings)
            );
            for (service, count) in &stats.usage_by_service {
                println!("   {service:<20} {count:>10} files");
            }
            if stats.missing_entries > 0 {
                println!(" {} reported paths not found on disk", stats.missing_entries);
            }
            println!();

            println!(" Recent scans:");
            if scans.is_empty() {
                println!("   none");
            }
            for scan in &scans {
                println!(
                    "   #{:<5} {:<20} {:<20} {} files  {}",
                    scan.id,
                    truncate(&scan.scan_type.to_string(), 20),
                    scan.status.to_string(),
                    scan.files_scanned,
                    scan.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
        }
        OutputFormat::Json => {
            let report = StatusReport {
                scans: &scans,
                stats: &stats,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn print_orphans(orphans: &[FileRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let total: u64 = orphans.iter().map(|f| f.size).sum();
            println!();
            println!("{}", "─".repeat(70));
            println!(" Orphaned Files ({}, {})", orphans.len(), format_size(total));
            println!("{}", "─".repeat(70));
            for file in orphans {
                println!(" {:>10}  {}", format_size(file.size), file.path.display());
            }
            println!();
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(orphans)?);
        }
    }
    Ok(())
}

fn print_hardlinks(report: &HardlinkReport, top_n: usize, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!();
            println!("{}", "─".repeat(70));
            println!(" Hardlink Report");
            println!("{}", "─".repeat(70));
            println!();

            if !report.has_hardlinks() {
                println!(" No hardlinked files found.");
            } else {
                println!(
                    " {} groups ({} files), {} saved",
                    report.group_count(),
                    report.linked_files,
                    format_size(report.total_space_saved)
                );
                println!();
                for (i, group) in report.groups.iter().take(top_n).enumerate() {
                    println!(
                        " Group {} ({} links, {} each{})",
                        i + 1,
                        group.link_count(),
                        format_size(group.representative_size),
                        if group.size_mismatch { ", sizes differ" } else { "" }
                    );
                    for member in &group.members {
                        println!("   {}", member.path.display());
                    }
                    println!();
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
    }
    Ok(())
}

fn print_duplicates(report: &DuplicateReport, top_n: usize, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!();
            println!("{}", "─".repeat(70));
            println!(" Duplicate File Report");
            println!("{}", "─".repeat(70));
            println!();

            if report.groups.is_empty() {
                println!(" No duplicate files found.");
            } else {
                println!(
                    " Found {} duplicate groups among {} files",
                    report.groups.len(),
                    report.files_analyzed
                );
                println!(" Total wasted space: {}", format_size(report.total_wasted_space));
                println!();

                for (i, group) in report.groups.iter().take(top_n).enumerate() {
                    println!(
                        " Group {} ({} files, {} each, {} wasted, {:?})",
                        i + 1,
                        group.files.len(),
                        format_size(group.size),
                        format_size(group.wasted_bytes),
                        group.disk_class
                    );
                    for file in &group.files {
                        println!("   {}", file.path.display());
                    }
                    println!();
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report.groups)?);
        }
    }
    Ok(())
}

async fn run_test(engine: &ScanOrchestrator, mapping: Option<&str>) -> Result<()> {
    let results = engine.test_services().await;
    if results.is_empty() {
        println!(" No services configured.");
    }
    for (service, result) in &results {
        match result {
            Ok(()) => println!(" {service:<20} ok"),
            Err(e) => println!(" {service:<20} {e}"),
        }
    }

    if let Some(mapping) = mapping {
        let (service, local_prefix) = mapping
            .split_once('=')
            .ok_or_else(|| eyre!("Expected SERVICE=LOCAL_PREFIX, got {mapping}"))?;
        let validation = engine
            .validate_mapping(&ServiceId::from(service), Path::new(local_prefix))
            .await?;
        match &validation.found {
            Some(sample) => println!(
                " {service}: {} maps to {}",
                sample.reported,
                sample.translated.display()
            ),
            None => println!(
                " {service}: no sampled path under {local_prefix} ({} checked, prefixes: {})",
                validation.sampled,
                validation.container_prefixes.join(", ")
            ),
        }
    }

    Ok(())
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 1).collect();
        format!("{head}…")
    }
}

/// Parse a size string (e.g., "1KB", "10MB", "1GB").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');

    let multiplier: u64 = if s.ends_with("GB") || s.ends_with('G') {
        1024 * 1024 * 1024
    } else if s.ends_with("MB") || s.ends_with('M') {
        1024 * 1024
    } else if s.ends_with("KB") || s.ends_with('K') {
        1024
    } else {
        1
    };

    let num: f64 = digits
        .parse()
        .with_context(|| format!("Invalid size: {s}"))?;
    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use strayfile_reconcile::{
        BoxFuture, FetchContext, FileProvider, ProviderRegistry, ProviderResult, ReportedFile,
    };

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("1.5m").unwrap(), 1536 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_scan_request() {
        assert_eq!(
            scan_request(ScanKind::Incremental, None, vec![]).unwrap(),
            ScanRequest::Incremental
        );
        assert_eq!(
            scan_request(ScanKind::Service, Some("radarr".into()), vec![]).unwrap(),
            ScanRequest::ServiceUpdate(ServiceId::from("radarr"))
        );
        assert!(scan_request(ScanKind::Service, None, vec![]).is_err());
        assert!(scan_request(ScanKind::Rescan, None, vec![]).is_err());
    }

    #[test]
    fn test_load_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("strayfile.json");
        std::fs::write(
            &path,
            r#"{"roots": ["/mnt/media"], "services": [{"id": "radarr", "endpoint": "radarr.txt"}]}"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.roots, vec![PathBuf::from("/mnt/media")]);
        assert_eq!(config.services[0].endpoint.as_deref(), Some("radarr.txt"));

        std::fs::write(&path, r#"{"roots": []}"#).unwrap();
        assert!(load_config(&path).is_err());
    }

    /// Reports nothing until its fetch is cancelled.
    struct StalledProvider(ServiceId);

    impl FileProvider for StalledProvider {
        fn id(&self) -> &ServiceId {
            &self.0
        }

        fn test<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn get_all_files<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, ProviderResult<Vec<ReportedFile>>> {
            Box::pin(async move {
                loop {
                    ctx.check_cancelled()?;
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupt_cancels_scan() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.mkv"), "a").unwrap();

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StalledProvider("radarr".into())));
        let engine = Arc::new(
            ScanOrchestrator::new(
                Arc::new(MemoryStore::new()),
                Arc::new(EngineConfig::new([temp.path()])),
                Arc::new(registry),
            )
            .unwrap(),
        );

        let handle = engine.start(ScanRequest::Full).await.unwrap();
        let fired = AtomicBool::new(false);
        let interrupt = || {
            let first = !fired.swap(true, Ordering::SeqCst);
            async move {
                if first {
                    Ok::<(), std::io::Error>(())
                } else {
                    std::future::pending::<std::io::Result<()>>().await
                }
            }
        };

        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            wait_interruptible(&engine, handle, interrupt),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.status(), strayfile_core::ScanStatus::Cancelled);
        assert!(!engine.is_scanning());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ServiceUpdate(radarr)", 8), "Service…");
    }
}

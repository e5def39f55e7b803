//! Scan orchestration for strayfile.
//!
//! [`ScanOrchestrator`] ties the walker, the service reconciler and the
//! analyzers into scan runs with a persisted lifecycle:
//!
//! ```text
//! Initializing -> CountingFiles -> ScanningFilesystem
//!              -> CheckingService (1/N .. N/N) -> UpdatingOrphanedStatus
//! ```
//!
//! - Only one scan runs at a time. A second start is rejected.
//! - The walk checkpoints `last_processed_path` every
//!   `checkpoint_batch_size` files; an interrupted or cancelled scan resumes
//!   from there and restarts reconciliation in full.
//! - A `Running` scan that stops reporting progress for longer than the
//!   staleness window is treated as `Interrupted` on the next status query.
//! - Cancellation is graceful (current file or service call completes,
//!   status `Cancelled`); force-stop and the wall-clock ceiling abandon the
//!   work at once (status `Interrupted`).
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strayfile_core::{EngineConfig, MemoryStore};
//! use strayfile_engine::{ScanOrchestrator, ScanRequest};
//! use strayfile_reconcile::ProviderRegistry;
//!
//! let orchestrator = ScanOrchestrator::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(EngineConfig::new(["/mnt/media"])),
//!     Arc::new(ProviderRegistry::new()),
//! )?;
//! let summary = orchestrator.run(ScanRequest::Full).await?;
//! println!("{} files, status {}", summary.scan.files_scanned, summary.status());
//! ```

mod error;
mod orchestrator;
mod progress;
mod stats;

pub use error::{EngineError, EngineResult};
pub use orchestrator::{HashSummary, ScanHandle, ScanOrchestrator, ScanRequest, ScanSummary};
pub use progress::{LOG_CHANNEL_SIZE, ProgressSnapshot, ProgressTracker, SubscriberId};
pub use stats::{LibraryStats, StatsCache};

//! Core types and traits for strayfile.
//!
//! This crate provides the data model shared by every other strayfile crate:
//! file, usage and scan records, the engine configuration, the persistence
//! gateway contract (with an in-memory implementation) and the bounded
//! worker pool used for concurrent fan-out.

mod config;
mod error;
mod memory;
mod pool;
mod record;
mod scan;
mod store;

pub use config::{
    DiskPoolConfig, EngineConfig, EngineConfigBuilder, PathMapping, ServiceConfig,
    MAX_SLOW_TIMEOUT_MULTIPLIER,
};
pub use error::{ScanError, ScanWarning, StoreError, WarningKind};
pub use memory::MemoryStore;
pub use pool::{PoolResults, WorkerPool};
pub use record::{
    ContentHash, FileDiskLocation, FileId, FileRecord, HashLevel, HashLevels, InodeInfo,
    ObservedFile, ServiceId, ServiceMissingEntry, UsageMetadata, UsageRecord,
};
pub use scan::{NewScan, ScanId, ScanPhase, ScanRecord, ScanStatus, ScanType};
pub use store::{
    FileQuery, FileUpsert, PersistenceGateway, SortField, SortOrder, StoreResult,
};

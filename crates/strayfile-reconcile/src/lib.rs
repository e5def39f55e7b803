//! Reconciliation of external media services against the file store.
//!
//! - [`PathTranslator`] rewrites a service's path into a local path using
//!   ordered prefix rules, with a bounded cache.
//! - [`FileProvider`] is the one capability required of each service;
//!   providers live in a [`ProviderRegistry`] keyed by service id.
//! - [`ServiceReconciler`] fetches every active service concurrently, writes
//!   usage records, records unmatched paths and recomputes orphan status.
//!
//! A failing service never aborts the others; its error is returned in the
//! [`ReconcileReport`] and its previous usages are left in place.

mod provider;
mod reconciler;
mod translator;

pub use provider::{
    BoxFuture, FetchContext, FileProvider, ProviderError, ProviderRegistry, ProviderResult,
    ReportedFile,
};
pub use reconciler::{
    MappingValidation, OrphanSummary, ReconcileEvent, ReconcileObserver, ReconcileReport,
    ServiceOutcome, ServiceReconciler,
};
pub use translator::{CacheStats, PathTranslator, SAMPLE_LIMIT, SampleMatch, resolve_local};

//! File provider trait and registry.
//!
//! A [`FileProvider`] is the single normalized capability the engine needs
//! from an external media service: list the files it uses and test that it
//! can be reached. Wire protocols live behind implementations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use strayfile_core::{EngineConfig, ServiceId, UsageMetadata, WorkerPool};

/// Type alias for boxed futures returned by provider methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by a file provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Service '{service}' timed out after {timeout_ms}ms")]
    Timeout { service: ServiceId, timeout_ms: u64 },

    #[error("Service '{service}' rejected credentials: {message}")]
    Auth { service: ServiceId, message: String },

    #[error("Service '{service}' returned a malformed response: {message}")]
    Malformed { service: ServiceId, message: String },

    #[error("Service '{service}' is unreachable: {message}")]
    Unreachable { service: ServiceId, message: String },

    #[error("Service '{service}' was cancelled")]
    Cancelled { service: ServiceId },

    #[error("No provider registered for service '{service}'")]
    NotRegistered { service: ServiceId },

    #[error("Service '{service}' error: {message}")]
    Other { service: ServiceId, message: String },
}

impl ProviderError {
    pub fn timeout(service: &ServiceId, timeout: Duration) -> Self {
        Self::Timeout {
            service: service.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn service(&self) -> &ServiceId {
        match self {
            Self::Timeout { service, .. }
            | Self::Auth { service, .. }
            | Self::Malformed { service, .. }
            | Self::Unreachable { service, .. }
            | Self::Cancelled { service }
            | Self::NotRegistered { service }
            | Self::Other { service, .. } => service,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// One file as reported by a service, before translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedFile {
    pub reported_path: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub metadata: Option<UsageMetadata>,
}

impl ReportedFile {
    pub fn new(reported_path: impl Into<String>) -> Self {
        Self {
            reported_path: reported_path.into(),
            size: None,
            metadata: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// Per-call context handed to [`FileProvider::get_all_files`].
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub service: ServiceId,
    /// Checked between pages or entities; a provider should return
    /// [`ProviderError::Cancelled`] once set.
    pub cancel: CancellationToken,
    /// Timeout for each request the provider makes.
    pub request_timeout: Duration,
    /// Ceiling for the provider's own concurrent requests.
    pub concurrency: usize,
}

impl FetchContext {
    pub fn new(service: ServiceId, config: &EngineConfig, cancel: CancellationToken) -> Self {
        Self {
            request_timeout: config.api_timeout(&service),
            concurrency: config.fetch_concurrency,
            service,
            cancel,
        }
    }

    /// A worker pool sized for this provider's internal fan-out.
    pub fn pool<T, E>(&self) -> WorkerPool<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        WorkerPool::new(self.concurrency)
    }

    pub fn check_cancelled(&self) -> ProviderResult<()> {
        if self.cancel.is_cancelled() {
            Err(ProviderError::Cancelled {
                service: self.service.clone(),
            })
        } else {
            Ok(())
        }
    }
}

/// Source of the files one external service uses.
pub trait FileProvider: Send + Sync {
    /// Service this provider speaks for.
    fn id(&self) -> &ServiceId;

    /// Check connectivity and credentials.
    fn test<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>>;

    /// Every file the service currently references.
    fn get_all_files<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, ProviderResult<Vec<ReportedFile>>>;

    /// Whether [`get_sample_file`](Self::get_sample_file) is implemented.
    fn supports_sampling(&self) -> bool {
        false
    }

    /// One reported path under `container_prefix`, without a full listing.
    fn get_sample_file<'a>(&'a self, _container_prefix: &'a str) -> BoxFuture<'a, ProviderResult<Option<String>>> {
        Box::pin(async { Ok(None) })
    }
}

/// Providers keyed by service id, in registration order.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: IndexMap<ServiceId, Arc<dyn FileProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one for the same service.
    pub fn register(&mut self, provider: Arc<dyn FileProvider>) -> Option<Arc<dyn FileProvider>> {
        let id = provider.id().clone();
        self.providers.insert(id, provider)
    }

    pub fn unregister(&mut self, service: &ServiceId) -> Option<Arc<dyn FileProvider>> {
        self.providers.shift_remove(service)
    }

    pub fn get(&self, service: &ServiceId) -> Option<Arc<dyn FileProvider>> {
        self.providers.get(service).cloned()
    }

    pub fn contains(&self, service: &ServiceId) -> bool {
        self.providers.contains_key(service)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.providers.keys()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Services taking part in reconciliation.
    ///
    /// Every service enabled in `config` comes first, in config order, even
    /// without a provider (it then fails as [`ProviderError::NotRegistered`]).
    /// Registered providers not mentioned in `config` follow.
    pub fn active(&self, config: &EngineConfig) -> Vec<ServiceId> {
        let mut active = config.enabled_services();
        for id in self.providers.keys() {
            if config.service(id).is_none() {
                active.push(id.clone());
            }
        }
        active
    }

    /// Services switched off in `config`.
    pub fn disabled(&self, config: &EngineConfig) -> Vec<ServiceId> {
        config
            .services
            .iter()
            .filter(|s| !s.enabled)
            .map(|s| s.id.clone())
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strayfile_core::ServiceConfig;

    struct Named(ServiceId);

    impl FileProvider for Named {
        fn id(&self) -> &ServiceId {
            &self.0
        }

        fn test<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn get_all_files<'a>(&'a self, _ctx: &'a FetchContext) -> BoxFuture<'a, ProviderResult<Vec<ReportedFile>>> {
            Box::pin(async { Ok(vec![]) })
        }
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let mut registry = ProviderRegistry::new();
        for id in ["sonarr", "radarr", "plex"] {
            registry.register(Arc::new(Named(id.into())));
        }
        let ids: Vec<&str> = registry.ids().map(|s| s.as_str()).collect();
        assert_eq!(ids, vec!["sonarr", "radarr", "plex"]);

        assert!(registry.register(Arc::new(Named("radarr".into()))).is_some());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_active_services() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Named("sonarr".into())));
        registry.register(Arc::new(Named("plex".into())));

        let mut config = EngineConfig::new(["/m"]);
        let mut plex = ServiceConfig::new("plex");
        plex.enabled = false;
        config.services = vec![ServiceConfig::new("radarr"), plex];

        let active = registry.active(&config);
        assert_eq!(active, vec![ServiceId::from("radarr"), ServiceId::from("sonarr")]);
        assert_eq!(registry.disabled(&config), vec![ServiceId::from("plex")]);
    }

    #[test]
    fn test_error_service_accessor() {
        let err = ProviderError::timeout(&"plex".into(), Duration::from_secs(2));
        assert_eq!(err.service().as_str(), "plex");
        assert!(err.to_string().contains("2000ms"));
    }
}

//! Engine configuration types.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::record::{HashLevels, ServiceId};

/// Upper bound for [`EngineConfig::slow_timeout_multiplier`].
pub const MAX_SLOW_TIMEOUT_MULTIPLIER: u32 = 10;

/// A path rewrite rule from a service's namespace to the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    /// Service the rule applies to; `None` makes it global.
    #[serde(default)]
    pub service: Option<ServiceId>,
    /// Prefix as the service sees it (e.g. `/movies`).
    pub container_prefix: String,
    /// Prefix on the local filesystem (e.g. `/mnt/user/media/movies`).
    pub local_prefix: String,
}

impl PathMapping {
    /// A rule applying to every service.
    pub fn global(container_prefix: impl Into<String>, local_prefix: impl Into<String>) -> Self {
        Self {
            service: None,
            container_prefix: container_prefix.into(),
            local_prefix: local_prefix.into(),
        }
    }

    /// A rule applying to one service.
    pub fn for_service(
        service: impl Into<ServiceId>,
        container_prefix: impl Into<String>,
        local_prefix: impl Into<String>,
    ) -> Self {
        Self {
            service: Some(service.into()),
            container_prefix: container_prefix.into(),
            local_prefix: local_prefix.into(),
        }
    }
}

/// Connection settings for one external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: ServiceId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Overrides [`EngineConfig::api_timeout_secs`] for this service.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ServiceConfig {
    pub fn new(id: impl Into<ServiceId>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            endpoint: None,
            api_key: None,
            timeout_secs: None,
        }
    }
}

/// A pooled volume made of several physical disks (mergerfs style).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPoolConfig {
    /// Mount point of the pooled view.
    pub pool_path: PathBuf,
    /// Mount points of the member disks.
    pub disk_paths: Vec<PathBuf>,
}

/// Configuration consumed by the scan engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Root paths to scan.
    pub roots: Vec<PathBuf>,

    /// Ordered path mapping rules.
    #[builder(default)]
    #[serde(default)]
    pub path_mappings: Vec<PathMapping>,

    /// Known services.
    #[builder(default)]
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Number of threads for walking (0 = auto-detect).
    #[builder(default = "0")]
    #[serde(default)]
    pub scan_threads: usize,

    /// Concurrency ceiling for a provider's internal fetch.
    #[builder(default = "20")]
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Timeout for a single external call, in seconds.
    #[builder(default = "30")]
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,

    /// Multiplier applied to the API timeout for bulk file listings.
    #[builder(default = "4")]
    #[serde(default = "default_slow_timeout_multiplier")]
    pub slow_timeout_multiplier: u32,

    /// Path translation cache capacity.
    #[builder(default = "50_000")]
    #[serde(default = "default_path_cache_size")]
    pub path_cache_size: usize,

    /// Occupancy fraction at which the translation cache evicts a batch.
    #[builder(default = "0.9")]
    #[serde(default = "default_path_cache_cleanup_threshold")]
    pub path_cache_cleanup_threshold: f64,

    /// Library statistics cache TTL, in seconds.
    #[builder(default = "300")]
    #[serde(default = "default_stats_cache_ttl_secs")]
    pub stats_cache_ttl_secs: u64,

    /// Entries processed between checkpoints.
    #[builder(default = "1000")]
    #[serde(default = "default_checkpoint_batch_size")]
    pub checkpoint_batch_size: usize,

    /// A running scan silent for this long is considered interrupted.
    #[builder(default = "900")]
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,

    /// Wall-clock ceiling for a whole scan, in seconds.
    #[builder(default = "86_400")]
    #[serde(default = "default_max_scan_duration_secs")]
    pub max_scan_duration_secs: u64,

    /// Errors kept per scan record.
    #[builder(default = "1000")]
    #[serde(default = "default_max_stored_errors")]
    pub max_stored_errors: usize,

    /// Per-entry walk errors tolerated before the walk aborts (None = unlimited).
    #[builder(default)]
    #[serde(default)]
    pub max_walk_errors: Option<u64>,

    /// Progressive hashing prefix sizes.
    #[builder(default)]
    #[serde(default)]
    pub hash_levels: HashLevels,

    /// Smallest file considered for duplicate detection.
    #[builder(default = "1")]
    #[serde(default = "default_min_duplicate_size")]
    pub min_duplicate_size: u64,

    /// Glob patterns excluded from the walk.
    #[builder(default)]
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Include hidden files (starting with .).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub include_hidden: bool,

    /// Follow symbolic links.
    #[builder(default = "false")]
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Look up reported paths verbatim when no mapping rule matches.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub passthrough_unmapped: bool,

    /// Multi-disk pool layout for disk-location scans.
    #[builder(default)]
    #[serde(default)]
    pub disk_pool: Option<DiskPoolConfig>,
}

fn default_true() -> bool {
    true
}

fn default_fetch_concurrency() -> usize {
    20
}

fn default_api_timeout_secs() -> u64 {
    30
}

fn default_slow_timeout_multiplier() -> u32 {
    4
}

fn default_path_cache_size() -> usize {
    50_000
}

fn default_path_cache_cleanup_threshold() -> f64 {
    0.9
}

fn default_stats_cache_ttl_secs() -> u64 {
    300
}

fn default_checkpoint_batch_size() -> usize {
    1000
}

fn default_staleness_window_secs() -> u64 {
    900
}

fn default_max_scan_duration_secs() -> u64 {
    86_400
}

fn default_max_stored_errors() -> usize {
    1000
}

fn default_min_duplicate_size() -> u64 {
    1
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.roots {
            Some(ref roots) if !roots.is_empty() => {}
            _ => return Err("At least one root path is required".to_string()),
        }
        if self.path_cache_size == Some(0) {
            return Err("Path cache size must be positive".to_string());
        }
        if let Some(threshold) = self.path_cache_cleanup_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err("Path cache cleanup threshold must be in (0, 1]".to_string());
            }
        }
        if let Some(ref levels) = self.hash_levels {
            validate_hash_levels(levels)?;
        }
        if let Some(ref services) = self.services {
            validate_services(services)?;
        }
        Ok(())
    }
}

fn validate_hash_levels(levels: &HashLevels) -> Result<(), String> {
    let prefixes = levels.prefixes();
    if prefixes.is_empty() {
        return Err("At least one hash level is required".to_string());
    }
    if prefixes[0] == 0 || prefixes.windows(2).any(|w| w[0] >= w[1]) {
        return Err("Hash levels must be positive and strictly increasing".to_string());
    }
    if prefixes.len() >= u8::MAX as usize {
        return Err("Too many hash levels".to_string());
    }
    Ok(())
}

fn validate_services(services: &[ServiceConfig]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for service in services {
        if !seen.insert(&service.id) {
            return Err(format!("Duplicate service id: {}", service.id));
        }
    }
    Ok(())
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Create a config scanning the given roots with defaults everywhere else.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            path_mappings: Vec::new(),
            services: Vec::new(),
            scan_threads: 0,
            fetch_concurrency: default_fetch_concurrency(),
            api_timeout_secs: default_api_timeout_secs(),
            slow_timeout_multiplier: default_slow_timeout_multiplier(),
            path_cache_size: default_path_cache_size(),
            path_cache_cleanup_threshold: default_path_cache_cleanup_threshold(),
            stats_cache_ttl_secs: default_stats_cache_ttl_secs(),
            checkpoint_batch_size: default_checkpoint_batch_size(),
            staleness_window_secs: default_staleness_window_secs(),
            max_scan_duration_secs: default_max_scan_duration_secs(),
            max_stored_errors: default_max_stored_errors(),
            max_walk_errors: None,
            hash_levels: HashLevels::default(),
            min_duplicate_size: default_min_duplicate_size(),
            ignore_patterns: Vec::new(),
            include_hidden: true,
            follow_symlinks: false,
            passthrough_unmapped: true,
            disk_pool: None,
        }
    }

    /// Validate a config that did not come through the builder.
    pub fn validate(&self) -> Result<(), String> {
        if self.roots.is_empty() {
            return Err("At least one root path is required".to_string());
        }
        if self.path_cache_size == 0 {
            return Err("Path cache size must be positive".to_string());
        }
        if !(self.path_cache_cleanup_threshold > 0.0 && self.path_cache_cleanup_threshold <= 1.0) {
            return Err("Path cache cleanup threshold must be in (0, 1]".to_string());
        }
        validate_hash_levels(&self.hash_levels)?;
        validate_services(&self.services)
    }

    /// Ids of services that take part in reconciliation.
    pub fn enabled_services(&self) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn service(&self, id: &ServiceId) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| &s.id == id)
    }

    /// Timeout for a single call to `service`.
    pub fn api_timeout(&self, service: &ServiceId) -> Duration {
        let secs = self
            .service(service)
            .and_then(|s| s.timeout_secs)
            .unwrap_or(self.api_timeout_secs);
        Duration::from_secs(secs.max(1))
    }

    /// Timeout for a bulk listing from `service`.
    pub fn bulk_timeout(&self, service: &ServiceId) -> Duration {
        let multiplier = self
            .slow_timeout_multiplier
            .clamp(1, MAX_SLOW_TIMEOUT_MULTIPLIER);
        self.api_timeout(service) * multiplier
    }

    pub fn checkpoint_batch_size(&self) -> usize {
        self.checkpoint_batch_size.max(1)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn max_scan_duration(&self) -> Duration {
        Duration::from_secs(self.max_scan_duration_secs)
    }

    pub fn stats_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .roots(vec![PathBuf::from("/mnt/media")])
            .scan_threads(4usize)
            .follow_symlinks(true)
            .build()
            .unwrap();

        assert_eq!(config.roots, vec![PathBuf::from("/mnt/media")]);
        assert_eq!(config.scan_threads, 4);
        assert!(config.follow_symlinks);
        assert_eq!(config.path_cache_size, 50_000);
        assert_eq!(config.checkpoint_batch_size, 1000);
    }

    #[test]
    fn test_builder_requires_roots() {
        let err = EngineConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn test_builder_rejects_bad_hash_levels() {
        let result = EngineConfig::builder()
            .roots(vec![PathBuf::from("/m")])
            .hash_levels(HashLevels::new(vec![10, 5]))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_duplicate_services() {
        let result = EngineConfig::builder()
            .roots(vec![PathBuf::from("/m")])
            .services(vec![ServiceConfig::new("plex"), ServiceConfig::new("plex")])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_timeouts() {
        let mut config = EngineConfig::new(["/m"]);
        let mut slow = ServiceConfig::new("plex");
        slow.timeout_secs = Some(5);
        config.services = vec![ServiceConfig::new("sonarr"), slow];
        config.slow_timeout_multiplier = 50;

        assert_eq!(config.api_timeout(&"sonarr".into()), Duration::from_secs(30));
        assert_eq!(config.api_timeout(&"plex".into()), Duration::from_secs(5));
        // multiplier is capped
        assert_eq!(config.bulk_timeout(&"plex".into()), Duration::from_secs(50));
    }

    #[test]
    fn test_enabled_services() {
        let mut config = EngineConfig::new(["/m"]);
        let mut disabled = ServiceConfig::new("lidarr");
        disabled.enabled = false;
        config.services = vec![ServiceConfig::new("radarr"), disabled];
        assert_eq!(config.enabled_services(), vec![ServiceId::from("radarr")]);
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"roots": ["/mnt/media"], "services": [{"id": "radarr"}]}"#,
        )
        .unwrap();
        assert!(config.services[0].enabled);
        assert_eq!(config.api_timeout_secs, 30);
        assert_eq!(config.hash_levels, HashLevels::default());
        assert!(config.validate().is_ok());
    }
}

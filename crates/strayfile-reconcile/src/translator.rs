//! Service path to local path translation with a bounded cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use strayfile_core::{EngineConfig, PathMapping, ServiceId};

/// Upper bound on samples examined by [`PathTranslator::sample_match`].
pub const SAMPLE_LIMIT: usize = 100;

type CacheKey = (ServiceId, String);

/// A sample whose translation landed under the requested prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMatch {
    pub reported: String,
    pub translated: PathBuf,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

/// Rewrites service-reported paths into local paths.
///
/// The most specific rule wins: service rules are consulted before global
/// ones, and among those the longest container prefix matching on a path
/// component boundary. Results are cached per `(service, reported path)`;
/// changing the rules drops the whole cache.
///
/// Local prefixes that exist are resolved through symlinks, as the walker
/// resolves its roots, so translated paths compare equal to stored ones.
pub struct PathTranslator {
    rules: RwLock<Vec<PathMapping>>,
    /// Symlinked roots as configured, with their resolved form.
    root_aliases: Vec<(PathBuf, PathBuf)>,
    cache: RwLock<IndexMap<CacheKey, Option<PathBuf>>>,
    capacity: usize,
    cleanup_threshold: f64,
    passthrough_unmapped: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl PathTranslator {
    pub fn new(rules: Vec<PathMapping>, capacity: usize, cleanup_threshold: f64) -> Self {
        Self {
            rules: RwLock::new(normalize_rules(rules)),
            root_aliases: Vec::new(),
            cache: RwLock::new(IndexMap::new()),
            capacity: capacity.max(1),
            cleanup_threshold: cleanup_threshold.clamp(f64::MIN_POSITIVE, 1.0),
            passthrough_unmapped: true,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.path_mappings.clone(),
            config.path_cache_size,
            config.path_cache_cleanup_threshold,
        )
        .with_passthrough(config.passthrough_unmapped)
        .with_roots(&config.roots)
    }

    /// Whether an absolute path no rule matches is used verbatim.
    pub fn with_passthrough(mut self, enabled: bool) -> Self {
        self.passthrough_unmapped = enabled;
        self
    }

    /// Rewrite passed-through paths under symlinked `roots` to the resolved
    /// root.
    pub fn with_roots(mut self, roots: &[PathBuf]) -> Self {
        self.root_aliases = roots
            .iter()
            .filter_map(|root| {
                let resolved = root.canonicalize().ok()?;
                (resolved != *root).then(|| (root.clone(), resolved))
            })
            .collect();
        self
    }

    /// Replace every rule and drop the cache.
    pub fn set_rules(&self, rules: Vec<PathMapping>) {
        let mut current = self.rules.write();
        *current = normalize_rules(rules);
        self.cache.write().clear();
        debug!(rules = current.len(), "path mapping rules replaced");
    }

    pub fn rules(&self) -> Vec<PathMapping> {
        self.rules.read().clone()
    }

    /// Translate a reported path, or `None` when it cannot be mapped.
    pub fn translate(&self, service: &ServiceId, reported: &str) -> Option<PathBuf> {
        let key = (service.clone(), reported.to_string());
        if let Some(hit) = self.cache.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return hit.clone();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Holding the rules lock until the insert keeps a concurrent
        // `set_rules` from being followed by a stale cache entry.
        let rules = self.rules.read();
        let translated = resolve(&rules, service, reported, self.passthrough_unmapped)
            .map(|path| self.dealias(path));
        trace!(service = %service, reported, translated = ?translated, "translated path");

        let mut cache = self.cache.write();
        self.evict_if_needed(&mut cache);
        cache.insert(key, translated.clone());
        translated
    }

    /// Container prefixes that map onto `local_prefix` for `service`.
    ///
    /// A rule whose local prefix lies under `local_prefix` yields its own
    /// container prefix; a rule whose local prefix contains `local_prefix`
    /// yields the container prefix extended by the remainder.
    pub fn reverse(&self, service: &ServiceId, local_prefix: &Path) -> Vec<String> {
        let rules = self.rules.read();
        let mut prefixes = Vec::new();
        for rule in applicable(&rules, service) {
            let local = Path::new(&rule.local_prefix);
            if local.starts_with(local_prefix) {
                prefixes.push(rule.container_prefix.clone());
            } else if let Ok(rest) = local_prefix.strip_prefix(local) {
                prefixes.push(join_reported(&rule.container_prefix, &rest.to_string_lossy()));
            }
        }
        prefixes.dedup();
        prefixes
    }

    /// First of at most [`SAMPLE_LIMIT`] samples whose translation lies under
    /// `local_prefix`.
    pub fn sample_match(
        &self,
        service: &ServiceId,
        samples: &[String],
        local_prefix: &Path,
    ) -> Option<SampleMatch> {
        samples.iter().take(SAMPLE_LIMIT).find_map(|reported| {
            self.translate(service, reported)
                .filter(|translated| translated.starts_with(local_prefix))
                .map(|translated| SampleMatch {
                    reported: reported.clone(),
                    translated,
                })
        })
    }

    fn dealias(&self, path: PathBuf) -> PathBuf {
        for (configured, resolved) in &self.root_aliases {
            if let Ok(rest) = path.strip_prefix(configured) {
                return resolved.join(rest);
            }
        }
        path
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop the oldest tenth of the capacity once occupancy crosses the
    /// cleanup threshold.
    fn evict_if_needed(&self, cache: &mut IndexMap<CacheKey, Option<PathBuf>>) {
        let threshold = ((self.capacity as f64) * self.cleanup_threshold).ceil() as usize;
        if cache.len() < threshold.clamp(1, self.capacity) {
            return;
        }
        let batch = (self.capacity / 10).max(1).min(cache.len());
        cache.drain(..batch);
        self.evicted.fetch_add(batch as u64, Ordering::Relaxed);
        debug!(evicted = batch, remaining = cache.len(), "path cache cleanup");
    }
}

impl std::fmt::Debug for PathTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathTranslator")
            .field("rules", &self.rules.read().len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

fn normalize_rules(rules: Vec<PathMapping>) -> Vec<PathMapping> {
    rules
        .into_iter()
        .map(|mut rule| {
            rule.container_prefix = trim_separator(&rule.container_prefix).to_string();
            rule.local_prefix = resolve_local(Path::new(trim_separator(&rule.local_prefix)))
                .to_string_lossy()
                .into_owned();
            rule
        })
        .collect()
}

/// `path` with symlinks resolved when it exists, unchanged otherwise.
pub fn resolve_local(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn trim_separator(prefix: &str) -> &str {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() && prefix.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Service rules first, then global ones.
fn applicable<'a>(rules: &'a [PathMapping], service: &'a ServiceId) -> impl Iterator<Item = &'a PathMapping> {
    let scoped = rules.iter().filter(move |r| r.service.as_ref() == Some(service));
    let global = rules.iter().filter(|r| r.service.is_none());
    scoped.chain(global)
}

/// Remainder of `reported` after `prefix`, when the prefix ends on a
/// component boundary.
fn strip_component_prefix<'a>(reported: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return reported.strip_prefix('/');
    }
    let rest = reported.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

fn resolve(rules: &[PathMapping], service: &ServiceId, reported: &str, passthrough: bool) -> Option<PathBuf> {
    let best_in = |scoped: bool| {
        rules
            .iter()
            .filter(|r| {
                if scoped {
                    r.service.as_ref() == Some(service)
                } else {
                    r.service.is_none()
                }
            })
            .filter_map(|r| strip_component_prefix(reported, &r.container_prefix).map(|rest| (r, rest)))
            .max_by_key(|(r, _)| r.container_prefix.len())
    };

    match best_in(true).or_else(|| best_in(false)) {
        Some((rule, rest)) if rest.is_empty() => Some(PathBuf::from(&rule.local_prefix)),
        Some((rule, rest)) => Some(Path::new(&rule.local_prefix).join(rest)),
        None if passthrough && Path::new(reported).is_absolute() => Some(PathBuf::from(reported)),
        None => None,
    }
}

fn join_reported(prefix: &str, rest: &str) -> String {
    match (prefix, rest) {
        (p, "") => p.to_string(),
        ("/", r) => format!("/{r}"),
        (p, r) => format!("{p}/{r}"),
    }
}

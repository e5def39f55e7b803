//! File providers backed by manifest files.
//!
//! A manifest lists one reported path per line, optionally followed by a tab
//! and the size in bytes. Blank lines and lines starting with `#` are
//! skipped. The manifest location is the service's `endpoint`.

use std::path::{Path, PathBuf};

use strayfile_core::{EngineConfig, ServiceId};
use strayfile_reconcile::{
    BoxFuture, FetchContext, FileProvider, ProviderError, ProviderRegistry, ProviderResult,
    ReportedFile,
};

pub struct ManifestProvider {
    id: ServiceId,
    path: PathBuf,
}

impl ManifestProvider {
    pub fn new(id: ServiceId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }

    async fn read(&self) -> ProviderResult<String> {
        let path = self.path.clone();
        let service = self.id.clone();
        tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
            .await
            .map_err(|err| ProviderError::Other {
                service: service.clone(),
                message: err.to_string(),
            })?
            .map_err(|err| ProviderError::Unreachable {
                service,
                message: format!("{}: {err}", self.path.display()),
            })
    }
}

impl FileProvider for ManifestProvider {
    fn id(&self) -> &ServiceId {
        &self.id
    }

    fn test<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move { self.read().await.map(|_| ()) })
    }

    fn get_all_files<'a>(&'a self, ctx: &'a FetchContext) -> BoxFuture<'a, ProviderResult<Vec<ReportedFile>>> {
        Box::pin(async move {
            let contents = self.read().await?;
            ctx.check_cancelled()?;
            parse_manifest(&self.id, &contents)
        })
    }

    fn supports_sampling(&self) -> bool {
        true
    }

    fn get_sample_file<'a>(&'a self, container_prefix: &'a str) -> BoxFuture<'a, ProviderResult<Option<String>>> {
        Box::pin(async move {
            let contents = self.read().await?;
            let files = parse_manifest(&self.id, &contents)?;
            Ok(files
                .into_iter()
                .map(|f| f.reported_path)
                .find(|p| p.starts_with(container_prefix)))
        })
    }
}

fn parse_manifest(service: &ServiceId, contents: &str) -> ProviderResult<Vec<ReportedFile>> {
    let mut files = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let file = match line.split_once('\t') {
            Some((path, size)) => {
                let size = size.trim().parse::<u64>().map_err(|err| ProviderError::Malformed {
                    service: service.clone(),
                    message: format!("line {}: invalid size: {err}", number + 1),
                })?;
                ReportedFile::new(path).with_size(size)
            }
            None => ReportedFile::new(line),
        };
        files.push(file);
    }
    Ok(files)
}

/// Register a manifest provider for every configured service with an endpoint.
///
/// Relative manifest paths resolve against `base`.
pub fn registry_from_config(config: &EngineConfig, base: &Path) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for service in &config.services {
        if let Some(endpoint) = &service.endpoint {
            let path = base.join(endpoint);
            registry.register(std::sync::Arc::new(ManifestProvider::new(service.id.clone(), path)));
        }
    }
    registry
}

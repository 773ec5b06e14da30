//! Storage provider contract and registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bidmesh_model::{StorageSourceType, StorageSpec};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::error::StorageError;

/// A volume resolved to a host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStorage {
    pub spec: StorageSpec,

    /// Host file or directory to bind-mount at `spec.path`.
    pub source: PathBuf,

    /// Whether cleanup should delete `source`.
    pub owned: bool,
}

/// Resolves one kind of [`StorageSpec`] into a local mount source.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Source type this provider handles.
    fn source_type(&self) -> StorageSourceType;

    /// Whether the data is already available without fetching.
    async fn has_storage_locally(&self, spec: &StorageSpec) -> Result<bool, StorageError>;

    /// Materializes the volume.
    async fn prepare(&self, spec: &StorageSpec) -> Result<PreparedStorage, StorageError>;

    /// Releases anything `prepare` created.
    async fn cleanup(&self, prepared: &PreparedStorage) -> Result<(), StorageError> {
        if prepared.owned {
            remove_path(&prepared.source).await?;
        }
        Ok(())
    }
}

pub(crate) async fn remove_path(path: &std::path::Path) -> Result<(), StorageError> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::io(path)(e)),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    result.map_err(StorageError::io(path))
}

/// Providers keyed by source type.
#[derive(Clone, Default)]
pub struct StorageProviders {
    providers: HashMap<StorageSourceType, Arc<dyn StorageProvider>>,
}

impl StorageProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.providers.insert(provider.source_type(), provider);
        self
    }

    pub fn get(&self, source_type: StorageSourceType) -> Result<&Arc<dyn StorageProvider>, StorageError> {
        self.providers
            .get(&source_type)
            .ok_or(StorageError::UnsupportedSource(source_type))
    }

    /// True if every volume is available locally.
    pub async fn has_all_locally(&self, specs: &[StorageSpec]) -> Result<bool, StorageError> {
        for spec in specs {
            if !self.get(spec.source_type())?.has_storage_locally(spec).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Prepares every volume concurrently.
    ///
    /// On failure, volumes that were prepared are cleaned up before the
    /// error is returned.
    pub async fn prepare_all(
        &self,
        specs: &[StorageSpec],
    ) -> Result<Vec<PreparedStorage>, StorageError> {
        let providers = specs
            .iter()
            .map(|spec| self.get(spec.source_type()).map(|p| (p, spec)))
            .collect::<Result<Vec<_>, _>>()?;

        let results = join_all(
            providers.iter().map(|(provider, spec)| provider.prepare(spec)),
        )
        .await;

        let mut prepared = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(p) => prepared.push(p),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => warn!(error = %e, "additional storage preparation failure"),
            }
        }

        if let Some(err) = first_error {
            self.cleanup_all(&prepared).await;
            return Err(err);
        }

        debug!(count = prepared.len(), "prepared storage volumes");
        Ok(prepared)
    }

    /// Cleans up prepared volumes, logging failures.
    pub async fn cleanup_all(&self, prepared: &[PreparedStorage]) {
        let cleanups = prepared.iter().filter_map(|p| {
            let provider = self.get(p.spec.source_type()).ok()?;
            Some(async move { (p, provider.cleanup(p).await) })
        });
        for (p, result) in join_all(cleanups).await {
            if let Err(e) = result {
                warn!(volume = %p.spec.name, error = %e, "failed to clean up storage volume");
            }
        }
    }
}

impl std::fmt::Debug for StorageProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProviders")
            .field("source_types", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentStorage, ContentStore, InlineStorage};
    use bidmesh_model::StorageSource;

    fn inline(name: &str, data: &str) -> StorageSpec {
        StorageSpec {
            name: name.into(),
            path: format!("/inputs/{name}"),
            source: StorageSource::Inline { data: data.into() },
        }
    }

    #[tokio::test]
    async fn test_prepare_all_resolves_each_volume() {
        let dir = tempfile::tempdir().unwrap();
        let providers = StorageProviders::new()
            .register(Arc::new(InlineStorage::new(dir.path().join("inline"))));

        let prepared = providers
            .prepare_all(&[inline("a", "one"), inline("b", "two")])
            .await
            .unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(tokio::fs::read_to_string(&prepared[1].source).await.unwrap(), "two");

        providers.cleanup_all(&prepared).await;
        assert!(!prepared[0].source.exists());
    }

    #[tokio::test]
    async fn test_unregistered_source_type() {
        let providers = StorageProviders::new();
        let err = providers.prepare_all(&[inline("a", "x")]).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedSource(StorageSourceType::Inline)));
    }

    #[tokio::test]
    async fn test_failed_prepare_cleans_up_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let inline_root = dir.path().join("inline");
        let store = ContentStore::new(dir.path().join("content"));
        let providers = StorageProviders::new()
            .register(Arc::new(InlineStorage::new(inline_root.clone())))
            .register(Arc::new(ContentStorage::new(store)));

        let missing = StorageSpec {
            name: "missing".into(),
            path: "/inputs/missing".into(),
            source: StorageSource::Content {
                cid: "0".repeat(64),
            },
        };
        let err = providers
            .prepare_all(&[inline("a", "one"), missing])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ContentNotFound(_)));

        let mut entries = tokio::fs::read_dir(&inline_root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}

//! Host directory volumes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bidmesh_model::{StorageSource, StorageSourceType, StorageSpec};
use tracing::debug;

use crate::error::StorageError;
use crate::provider::{PreparedStorage, StorageProvider};

/// Mounts [`StorageSource::LocalDirectory`] volumes, restricted to an
/// allow-list of host roots. An empty allow-list rejects everything.
#[derive(Debug, Clone, Default)]
pub struct LocalDirectoryStorage {
    allowed_roots: Vec<PathBuf>,
}

impl LocalDirectoryStorage {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots }
    }

    async fn resolve(&self, spec: &StorageSpec) -> Result<PathBuf, StorageError> {
        let StorageSource::LocalDirectory { source_path } = &spec.source else {
            return Err(StorageError::WrongSource {
                expected: StorageSourceType::LocalDirectory,
                actual: spec.source_type(),
            });
        };

        let requested = Path::new(source_path);
        let canonical = tokio::fs::canonicalize(requested)
            .await
            .map_err(StorageError::io(requested))?;

        for root in &self.allowed_roots {
            let Ok(root) = tokio::fs::canonicalize(root).await else {
                continue;
            };
            if canonical.starts_with(&root) {
                return Ok(canonical);
            }
        }
        Err(StorageError::PathNotAllowed(canonical))
    }
}

#[async_trait]
impl StorageProvider for LocalDirectoryStorage {
    fn source_type(&self) -> StorageSourceType {
        StorageSourceType::LocalDirectory
    }

    async fn has_storage_locally(&self, spec: &StorageSpec) -> Result<bool, StorageError> {
        match self.resolve(spec).await {
            Ok(_) => Ok(true),
            Err(StorageError::Io { .. } | StorageError::PathNotAllowed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn prepare(&self, spec: &StorageSpec) -> Result<PreparedStorage, StorageError> {
        let source = self.resolve(spec).await?;
        debug!(volume = %spec.name, source = %source.display(), "mounting local directory");
        Ok(PreparedStorage {
            spec: spec.clone(),
            source,
            owned: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(source_path: &Path) -> StorageSpec {
        StorageSpec {
            name: "data".into(),
            path: "/inputs".into(),
            source: StorageSource::LocalDirectory {
                source_path: source_path.to_string_lossy().into_owned(),
            },
        }
    }

    #[tokio::test]
    async fn test_allowed_directory_is_mounted_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        tokio::fs::create_dir_all(&data).await.unwrap();

        let storage = LocalDirectoryStorage::new(vec![dir.path().to_path_buf()]);
        let prepared = storage.prepare(&volume(&data)).await.unwrap();
        assert!(!prepared.owned);
        assert!(prepared.source.ends_with("data"));

        storage.cleanup(&prepared).await.unwrap();
        assert!(data.exists());
    }

    #[tokio::test]
    async fn test_paths_outside_allow_list_rejected() {
        let allowed = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();

        let storage = LocalDirectoryStorage::new(vec![allowed.path().to_path_buf()]);
        let err = storage.prepare(&volume(other.path())).await.unwrap_err();
        assert!(matches!(err, StorageError::PathNotAllowed(_)));
        assert!(!storage.has_storage_locally(&volume(other.path())).await.unwrap());

        let escape = allowed.path().join("..");
        assert!(storage.prepare(&volume(&escape)).await.is_err());
    }
}

//! Inline data volumes.

use std::path::PathBuf;

use async_trait::async_trait;
use bidmesh_model::{StorageSource, StorageSourceType, StorageSpec};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::provider::{PreparedStorage, StorageProvider};

/// Writes [`StorageSource::Inline`] data into a scratch file per volume.
///
/// Jobs normally reach compute nodes with inline data already pinned, so
/// this only serves jobs submitted around the requester's transforms.
#[derive(Debug, Clone)]
pub struct InlineStorage {
    scratch_dir: PathBuf,
}

impl InlineStorage {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl StorageProvider for InlineStorage {
    fn source_type(&self) -> StorageSourceType {
        StorageSourceType::Inline
    }

    async fn has_storage_locally(&self, _spec: &StorageSpec) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn prepare(&self, spec: &StorageSpec) -> Result<PreparedStorage, StorageError> {
        let StorageSource::Inline { data } = &spec.source else {
            return Err(StorageError::WrongSource {
                expected: StorageSourceType::Inline,
                actual: spec.source_type(),
            });
        };

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(StorageError::io(&self.scratch_dir))?;

        // Keyed by (name, path, data): each volume owns its file.
        let mut hasher = Sha256::new();
        hasher.update(spec.name.as_bytes());
        hasher.update([0]);
        hasher.update(spec.path.as_bytes());
        hasher.update([0]);
        hasher.update(data.as_bytes());
        let name = format!("inline-{}", &hex::encode(hasher.finalize())[..16]);

        let source = self.scratch_dir.join(name);
        tokio::fs::write(&source, data.as_bytes())
            .await
            .map_err(StorageError::io(&source))?;

        Ok(PreparedStorage {
            spec: spec.clone(),
            source,
            owned: true,
        })
    }
}

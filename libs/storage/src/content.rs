//! Local content-addressed store.
//!
//! Objects live at `<root>/<cid>`, where the cid is the hex sha256 of the
//! content. Single blobs are stored as files, directories as directory
//! trees. Writing the same content twice is a no-op.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bidmesh_model::{StorageSource, StorageSourceType, StorageSpec};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::StorageError;
use crate::provider::{PreparedStorage, StorageProvider};

/// Pins data into content-addressed storage.
#[async_trait]
pub trait ContentPinner: Send + Sync {
    /// Stores `data` and returns its content id. Idempotent.
    async fn pin_bytes(&self, data: &[u8]) -> Result<String, StorageError>;
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `cid` if it is present.
    pub async fn locate(&self, cid: &str) -> Option<PathBuf> {
        if !is_valid_cid(cid) {
            return None;
        }
        let path = self.root.join(cid);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    pub async fn put_bytes(&self, data: &[u8]) -> Result<String, StorageError> {
        let cid = hex::encode(Sha256::digest(data));
        let target = self.root.join(&cid);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(cid);
        }

        self.ensure_root().await?;
        let staging = self.staging_path(&cid);
        tokio::fs::write(&staging, data)
            .await
            .map_err(StorageError::io(&staging))?;
        self.commit(&staging, &target).await?;
        debug!(cid = %cid, size = data.len(), "stored blob");
        Ok(cid)
    }

    /// Copies the directory tree at `source` into the store.
    ///
    /// The cid covers every relative file path and its contents, in sorted
    /// order.
    pub async fn put_dir(&self, source: &Path) -> Result<String, StorageError> {
        let files = list_files(source).await?;

        let mut hasher = Sha256::new();
        for relative in &files {
            let data = tokio::fs::read(source.join(relative))
                .await
                .map_err(StorageError::io(source.join(relative)))?;
            let name = relative.to_string_lossy();
            hasher.update((name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            hasher.update((data.len() as u64).to_be_bytes());
            hasher.update(&data);
        }
        let cid = hex::encode(hasher.finalize());

        let target = self.root.join(&cid);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(cid);
        }

        self.ensure_root().await?;
        let staging = self.staging_path(&cid);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(StorageError::io(&staging))?;
        for relative in &files {
            let dest = staging.join(relative);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(StorageError::io(parent))?;
            }
            tokio::fs::copy(source.join(relative), &dest)
                .await
                .map_err(StorageError::io(&dest))?;
        }
        self.commit(&staging, &target).await?;
        debug!(cid = %cid, files = files.len(), "stored directory");
        Ok(cid)
    }

    async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::io(&self.root))
    }

    fn staging_path(&self, cid: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!(".staging-{cid}-{}-{seq}", std::process::id()))
    }

    /// Renames staged content into place. A concurrent writer of the same
    /// content may win the race; that is fine.
    async fn commit(&self, staging: &Path, target: &Path) -> Result<(), StorageError> {
        match tokio::fs::rename(staging, target).await {
            Ok(()) => Ok(()),
            Err(_) if tokio::fs::try_exists(target).await.unwrap_or(false) => {
                crate::provider::remove_path(staging).await
            }
            Err(e) => Err(StorageError::io(target)(e)),
        }
    }
}

#[async_trait]
impl ContentPinner for ContentStore {
    async fn pin_bytes(&self, data: &[u8]) -> Result<String, StorageError> {
        self.put_bytes(data).await
    }
}

fn is_valid_cid(cid: &str) -> bool {
    cid.len() == 64 && cid.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Relative paths of every regular file under `root`, sorted.
async fn list_files(root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let dir = root.join(&relative);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(StorageError::io(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::io(&dir))? {
            let file_type = entry.file_type().await.map_err(StorageError::io(entry.path()))?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Serves [`StorageSource::Content`] volumes straight out of a
/// [`ContentStore`].
#[derive(Debug, Clone)]
pub struct ContentStorage {
    store: ContentStore,
}

impl ContentStorage {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StorageProvider for ContentStorage {
    fn source_type(&self) -> StorageSourceType {
        StorageSourceType::Content
    }

    async fn has_storage_locally(&self, spec: &StorageSpec) -> Result<bool, StorageError> {
        match &spec.source {
            StorageSource::Content { cid } => Ok(self.store.locate(cid).await.is_some()),
            _ => Err(StorageError::WrongSource {
                expected: StorageSourceType::Content,
                actual: spec.source_type(),
            }),
        }
    }

    async fn prepare(&self, spec: &StorageSpec) -> Result<PreparedStorage, StorageError> {
        let StorageSource::Content { cid } = &spec.source else {
            return Err(StorageError::WrongSource {
                expected: StorageSourceType::Content,
                actual: spec.source_type(),
            });
        };
        let source = self
            .store
            .locate(cid)
            .await
            .ok_or_else(|| StorageError::ContentNotFound(cid.clone()))?;
        Ok(PreparedStorage {
            spec: spec.clone(),
            source,
            owned: false,
        })
    }
}

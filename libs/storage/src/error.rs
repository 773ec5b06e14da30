use std::path::PathBuf;

use bidmesh_model::StorageSourceType;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No driver is registered for the volume's source type.
    #[error("no storage provider for source type {0}")]
    UnsupportedSource(StorageSourceType),

    /// The driver was handed a volume of another source type.
    #[error("storage provider for {expected} cannot handle {actual}")]
    WrongSource {
        expected: StorageSourceType,
        actual: StorageSourceType,
    },

    /// Content is not present in the local content store.
    #[error("content not found: {0}")]
    ContentNotFound(String),

    /// Local directory is outside every allowed root.
    #[error("path {0} is not under an allowed directory")]
    PathNotAllowed(PathBuf),

    /// Filesystem error.
    #[error("storage i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StorageError::Io { path, source }
    }
}

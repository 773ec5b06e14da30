//! Container runtime interface.
//!
//! The executor drives containers through [`ContainerRuntime`]. The Docker
//! implementation talks to the Engine API over its unix socket; the mock
//! keeps containers in memory for tests and development.

mod docker;
mod mock;

pub use docker::DockerRuntime;
pub use mock::{MockContainer, MockRuntime};

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no such container: {0}")]
    NotFound(String),
}

impl RuntimeError {
    /// The runtime's own error message, for matching known failures.
    pub fn message(&self) -> String {
        match self {
            RuntimeError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// A host path bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Resource limits in the runtime's native units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerResources {
    /// Memory limit in bytes; 0 means unlimited.
    pub memory_bytes: u64,
    /// CPU in units of 10^-9 cores; 0 means unlimited.
    pub nano_cpus: u64,
    /// Number of GPUs to request.
    pub gpu_count: u64,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// Entrypoint override; empty keeps the image default.
    pub entrypoint: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub resources: ContainerResources,
    pub network_disabled: bool,
}

/// Captured container output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls `image` if it is not present.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates a container and returns its ID.
    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn logs(&self, id: &str) -> Result<ContainerLogs, RuntimeError>;

    /// IDs of every container carrying `key=value`.
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError>;

    /// Force-removes a container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

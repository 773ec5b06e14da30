//! Configuration for the node binary.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bidmesh_compute::ComputeConfig;
use bidmesh_id::NodeId;
use bidmesh_requester::RequesterConfig;

/// Where jobs are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => bail!("unknown job store backend '{other}'"),
        }
    }
}

/// What runs the containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    Docker,
    Mock,
}

impl std::str::FromStr for RuntimeBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeBackend::Docker),
            "mock" => Ok(RuntimeBackend::Mock),
            other => bail!("unknown container runtime '{other}'"),
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    pub store: StoreBackend,

    pub runtime: RuntimeBackend,

    /// Job file (a JSON submission) to run at startup.
    pub submit_job: Option<PathBuf>,

    /// Requester public key, stamped on every job.
    pub public_key_path: Option<PathBuf>,

    /// Host roots jobs may mount as local directories.
    pub allowed_local_dirs: Vec<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub requester: RequesterConfig,

    pub compute: ComputeConfig,
}

impl NodeConfig {
    /// Defaults rooted at `data_dir`, with an in-memory store and runtime.
    pub fn local(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let compute = ComputeConfig {
            results_dir: data_dir.join("results"),
            ..Default::default()
        };
        Self {
            node_id: NodeId::new(),
            data_dir,
            store: StoreBackend::Memory,
            runtime: RuntimeBackend::Mock,
            submit_job: None,
            public_key_path: None,
            allowed_local_dirs: Vec::new(),
            log_level: "info".to_string(),
            requester: RequesterConfig::default(),
            compute,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Node ID can be provided or auto-generated
        let node_id = match std::env::var("BIDMESH_NODE_ID") {
            Ok(raw) => raw.parse().context("BIDMESH_NODE_ID")?,
            Err(_) => NodeId::new(),
        };

        let data_dir = std::env::var("BIDMESH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/bidmesh"));

        let store = match std::env::var("BIDMESH_JOB_STORE") {
            Ok(raw) => raw.parse().context("BIDMESH_JOB_STORE")?,
            Err(_) => StoreBackend::Sqlite,
        };

        let runtime = match std::env::var("BIDMESH_RUNTIME") {
            Ok(raw) => raw.parse().context("BIDMESH_RUNTIME")?,
            Err(_) => RuntimeBackend::Docker,
        };

        let mut compute = ComputeConfig::from_env()?;
        if std::env::var_os("BIDMESH_RESULTS_DIR").is_none() {
            compute.results_dir = data_dir.join("results");
        }

        Ok(Self {
            node_id,
            store,
            runtime,
            submit_job: std::env::var_os("BIDMESH_SUBMIT_JOB").map(PathBuf::from),
            public_key_path: std::env::var_os("BIDMESH_PUBLIC_KEY_PATH").map(PathBuf::from),
            allowed_local_dirs: std::env::var_os("BIDMESH_ALLOWED_LOCAL_DIRS")
                .map(|raw| std::env::split_paths(&raw).collect())
                .unwrap_or_default(),
            log_level: std::env::var("BIDMESH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            requester: RequesterConfig::from_env()?,
            compute,
            data_dir,
        })
    }

    pub fn job_store_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }
}

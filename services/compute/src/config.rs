//! Configuration for the compute node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bidmesh_model::ResourceUsage;

/// Compute node configuration.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Identity of this executor instance. Every container it creates is
    /// labelled with it.
    pub executor_id: String,

    /// Root of the per-shard results directories.
    pub results_dir: PathBuf,

    /// Keep containers after a run, for debugging.
    pub keep_stack: bool,

    /// Assume images are already present.
    pub skip_image_pull: bool,

    /// Docker Engine API socket.
    pub docker_socket: PathBuf,

    /// Resources this node offers. Zero quantities are measured from the
    /// host at startup.
    pub total_capacity: ResourceUsage,

    /// Largest request a single job may make. Zero means "up to total".
    pub job_limit: ResourceUsage,

    /// Resources assumed for jobs that request none.
    pub default_job_resources: ResourceUsage,

    /// Deadline for materializing a shard's input volumes.
    pub storage_timeout: Duration,

    /// Deadline for collecting container logs after the run ends.
    pub log_capture_timeout: Duration,

    /// Deadline for removing a shard's containers.
    pub cleanup_timeout: Duration,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            executor_id: "bidmesh".to_string(),
            results_dir: PathBuf::from("/var/lib/bidmesh/results"),
            keep_stack: false,
            skip_image_pull: false,
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            total_capacity: ResourceUsage::default(),
            job_limit: ResourceUsage::default(),
            default_job_resources: ResourceUsage {
                cpu: 0.1,
                memory: 100 * 1024 * 1024,
                disk: 0,
                gpu: 0,
            },
            storage_timeout: Duration::from_secs(600),
            log_capture_timeout: Duration::from_secs(3),
            cleanup_timeout: Duration::from_secs(60),
        }
    }
}

impl ComputeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let executor_id =
            std::env::var("BIDMESH_EXECUTOR_ID").unwrap_or(defaults.executor_id);
        let results_dir = std::env::var("BIDMESH_RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.results_dir);
        let docker_socket = std::env::var("BIDMESH_DOCKER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or(defaults.docker_socket);

        let total_capacity = ResourceUsage {
            cpu: env_parse("BIDMESH_TOTAL_CPU", 0.0)?,
            memory: env_parse("BIDMESH_TOTAL_MEMORY", 0)?,
            disk: env_parse("BIDMESH_TOTAL_DISK", 0)?,
            gpu: env_parse("BIDMESH_TOTAL_GPU", 0)?,
        };
        let job_limit = ResourceUsage {
            cpu: env_parse("BIDMESH_JOB_CPU_LIMIT", 0.0)?,
            memory: env_parse("BIDMESH_JOB_MEMORY_LIMIT", 0)?,
            disk: env_parse("BIDMESH_JOB_DISK_LIMIT", 0)?,
            gpu: env_parse("BIDMESH_JOB_GPU_LIMIT", 0)?,
        };

        Ok(Self {
            executor_id,
            results_dir,
            keep_stack: env_flag("BIDMESH_KEEP_STACK"),
            skip_image_pull: env_flag("BIDMESH_SKIP_IMAGE_PULL"),
            docker_socket,
            total_capacity,
            job_limit,
            default_job_resources: defaults.default_job_resources,
            storage_timeout: Duration::from_secs(env_parse(
                "BIDMESH_STORAGE_TIMEOUT",
                defaults.storage_timeout.as_secs(),
            )?),
            log_capture_timeout: Duration::from_secs(env_parse(
                "BIDMESH_LOG_CAPTURE_TIMEOUT",
                defaults.log_capture_timeout.as_secs(),
            )?),
            cleanup_timeout: Duration::from_secs(env_parse(
                "BIDMESH_CLEANUP_TIMEOUT",
                defaults.cleanup_timeout.as_secs(),
            )?),
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ComputeConfig::default();
        assert!(!config.keep_stack);
        assert_eq!(config.storage_timeout, Duration::from_secs(600));
        assert_eq!(config.log_capture_timeout, Duration::from_secs(3));
        assert_eq!(config.cleanup_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse("BIDMESH_TEST_UNSET_NUMBER", 42u64).unwrap(), 42);
    }
}

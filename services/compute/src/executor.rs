//! Runs one shard in a container and captures what it produced.
//!
//! Each shard gets a results directory holding `stdout`, `stderr`,
//! `exitCode` and one subdirectory per output volume. Output directories
//! are bind-mounted read-write, so the workload writes its outputs in
//! place. Every container is labelled with the executor's identity so a
//! sweep can reclaim anything a crashed run left behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bidmesh_id::JobId;
use bidmesh_model::{
    JobShard, ModelError, Network, ResourceUsage, RunResult, EXIT_CODE_FILE, STDERR_FILE,
    STDOUT_FILE,
};
use bidmesh_storage::{StorageError, StorageProviders};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ComputeConfig;
use crate::runtime::{
    ContainerConfig, ContainerLogs, ContainerResources, ContainerRuntime, Mount, RuntimeError,
};

/// Label carrying the executor's identity.
pub const EXECUTOR_LABEL: &str = "bidmesh-executor";
/// Label identifying the shard a container runs.
pub const JOB_LABEL: &str = "bidmesh-job";
/// Environment variable holding the serialized job.
pub const JOB_SPEC_ENV: &str = "BIDMESH_JOB_SPEC";

const EXECUTABLE_NOT_FOUND: &str = "executable file not found";

/// Setup failures. These abort a run before (or instead of) a container
/// doing any work.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error(transparent)]
    Resources(#[from] ModelError),

    #[error("failed to prepare storage: {0}")]
    Storage(#[from] StorageError),

    #[error("timed out preparing storage after {0:?}")]
    StorageTimeout(Duration),

    #[error(
        "failed to pull image {image}: {source}. It may not exist, or you may need to be \
         authorized to pull it"
    )]
    ImagePull {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to create container: {0}")]
    Create(#[source] RuntimeError),

    #[error("failed to serialize job: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExecutorError + '_ {
    move |source| ExecutorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// How the container run ended.
enum RunOutcome {
    StartFailed(String),
    Exited(i64),
    WaitFailed(String),
    Cancelled,
}

/// Executes shards on a container runtime.
pub struct ShardExecutor {
    id: String,
    runtime: Arc<dyn ContainerRuntime>,
    storage: StorageProviders,
    results_dir: PathBuf,
    keep_stack: bool,
    skip_image_pull: bool,
    storage_timeout: Duration,
    log_capture_timeout: Duration,
    cleanup_timeout: Duration,
}

impl ShardExecutor {
    pub fn new(
        config: &ComputeConfig,
        runtime: Arc<dyn ContainerRuntime>,
        storage: StorageProviders,
    ) -> Self {
        Self {
            id: config.executor_id.clone(),
            runtime,
            storage,
            results_dir: config.results_dir.clone(),
            keep_stack: config.keep_stack,
            skip_image_pull: config.skip_image_pull,
            storage_timeout: config.storage_timeout,
            log_capture_timeout: config.log_capture_timeout,
            cleanup_timeout: config.cleanup_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where a shard's results are written.
    pub fn shard_results_dir(&self, job_id: &JobId, index: u32) -> PathBuf {
        self.results_dir
            .join(job_id.to_string())
            .join(index.to_string())
    }

    fn job_label(&self, job_id: &JobId, index: u32) -> String {
        format!("{}{job_id}:{index}", self.id)
    }

    fn container_name(&self, job_id: &JobId, index: u32) -> String {
        format!("bidmesh-{}-{job_id}-{index}-executor", self.id)
    }

    /// Runs a shard to completion.
    ///
    /// Never fails outright: setup errors come back as a failed
    /// [`RunResult`]. Cancelling `cancel` stops waiting on the container;
    /// logs are still captured and the container is still removed.
    #[instrument(skip_all, fields(job_id = %shard.job.id(), shard_index = shard.index))]
    pub async fn run_shard(&self, shard: &JobShard, cancel: CancellationToken) -> RunResult {
        match self.try_run(shard, &cancel).await {
            Ok(result) => {
                debug!(exit_code = ?result.exit_code, error = ?result.error, "Shard run finished");
                result
            }
            Err(e) => {
                warn!(error = %e, "Shard setup failed");
                RunResult::failed(e.to_string())
            }
        }
    }

    async fn try_run(
        &self,
        shard: &JobShard,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        let job_id = *shard.job.id();
        let spec = &shard.job.spec;
        let volumes = shard.volumes();
        validate_volumes(shard)?;

        let results = self.shard_results_dir(&job_id, shard.index);
        if tokio::fs::try_exists(&results).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&results)
                .await
                .map_err(io_err(&results))?;
        }
        tokio::fs::create_dir_all(&results)
            .await
            .map_err(io_err(&results))?;

        let mut output_mounts = Vec::with_capacity(spec.outputs.len());
        for output in &spec.outputs {
            let dir = results.join(&output.name);
            tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
            output_mounts.push(Mount {
                source: dir,
                target: output.path.clone(),
                read_only: false,
            });
        }

        let usage = ResourceUsage::parse(&spec.resources)?;
        let resources = ContainerResources {
            memory_bytes: usage.memory,
            nano_cpus: (usage.cpu * 1e9) as u64,
            gpu_count: usage.gpu,
        };

        if !self.skip_image_pull {
            self.runtime
                .pull_image(&spec.docker.image)
                .await
                .map_err(|source| ExecutorError::ImagePull {
                    image: spec.docker.image.clone(),
                    source,
                })?;
        }

        let mut env = spec.docker.environment_variables.clone();
        env.push(format!("{JOB_SPEC_ENV}={}", serde_json::to_string(&shard.job)?));

        let prepared = tokio::time::timeout(self.storage_timeout, self.storage.prepare_all(&volumes))
            .await
            .map_err(|_| ExecutorError::StorageTimeout(self.storage_timeout))??;
        let mut mounts: Vec<Mount> = prepared
            .iter()
            .map(|p| Mount {
                source: p.source.clone(),
                target: p.spec.path.clone(),
                read_only: true,
            })
            .collect();
        mounts.extend(output_mounts);

        let config = ContainerConfig {
            name: self.container_name(&job_id, shard.index),
            image: spec.docker.image.clone(),
            entrypoint: spec.docker.entrypoint.clone(),
            env,
            working_dir: spec.docker.working_directory.clone(),
            labels: HashMap::from([
                (EXECUTOR_LABEL.to_string(), self.id.clone()),
                (JOB_LABEL.to_string(), self.job_label(&job_id, shard.index)),
            ]),
            mounts,
            resources,
            network_disabled: spec.network == Network::None,
        };

        let result = self.run_container(&config, &results, cancel).await;
        self.storage.cleanup_all(&prepared).await;
        result
    }

    async fn run_container(
        &self,
        config: &ContainerConfig,
        results: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        if cancel.is_cancelled() {
            info!("Shard cancelled before its container was created");
            return Ok(RunResult::failed("shard execution cancelled"));
        }
        let id = self
            .runtime
            .create(config)
            .await
            .map_err(ExecutorError::Create)?;
        info!(container_id = %id, name = %config.name, "Container created");

        let outcome = self.start_and_wait(&id, cancel).await;
        let result = self.capture(&id, results, outcome).await;
        self.remove_container(&id).await;
        result
    }

    async fn start_and_wait(&self, id: &str, cancel: &CancellationToken) -> RunOutcome {
        if let Err(e) = self.runtime.start(id).await {
            let message = e.message();
            warn!(container_id = %id, error = %message, "Container failed to start");
            if message.contains(EXECUTABLE_NOT_FOUND) {
                return RunOutcome::StartFailed(EXECUTABLE_NOT_FOUND.to_string());
            }
            return RunOutcome::StartFailed(format!("failed to start container: {message}"));
        }

        tokio::select! {
            waited = self.runtime.wait(id) => match waited {
                Ok(code) => RunOutcome::Exited(code),
                Err(e) => RunOutcome::WaitFailed(format!("failed waiting for container: {e}")),
            },
            _ = cancel.cancelled() => RunOutcome::Cancelled,
        }
    }

    /// Collects logs and writes the result files.
    ///
    /// Log capture has its own deadline and does not observe the run's
    /// cancellation token.
    async fn capture(
        &self,
        id: &str,
        results: &Path,
        outcome: RunOutcome,
    ) -> Result<RunResult, ExecutorError> {
        let mut errors = Vec::new();
        let exit_code = match outcome {
            RunOutcome::Exited(code) => Some(code),
            RunOutcome::StartFailed(e) | RunOutcome::WaitFailed(e) => {
                errors.push(e);
                None
            }
            RunOutcome::Cancelled => {
                errors.push("shard execution cancelled".to_string());
                None
            }
        };

        let logs = match tokio::time::timeout(self.log_capture_timeout, self.runtime.logs(id)).await
        {
            Ok(Ok(logs)) => logs,
            Ok(Err(e)) => {
                errors.push(format!("failed to capture logs: {e}"));
                ContainerLogs::default()
            }
            Err(_) => {
                errors.push(format!(
                    "timed out capturing logs after {:?}",
                    self.log_capture_timeout
                ));
                ContainerLogs::default()
            }
        };

        let stdout_path = results.join(STDOUT_FILE);
        let stderr_path = results.join(STDERR_FILE);
        tokio::fs::write(&stdout_path, &logs.stdout)
            .await
            .map_err(io_err(&stdout_path))?;
        tokio::fs::write(&stderr_path, &logs.stderr)
            .await
            .map_err(io_err(&stderr_path))?;
        if let Some(code) = exit_code {
            let path = results.join(EXIT_CODE_FILE);
            tokio::fs::write(&path, code.to_string())
                .await
                .map_err(io_err(&path))?;
        }

        Ok(RunResult {
            exit_code,
            stdout_path: Some(stdout_path),
            stderr_path: Some(stderr_path),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        })
    }

    async fn remove_container(&self, id: &str) {
        if self.keep_stack {
            info!(container_id = %id, "Keeping container");
            return;
        }
        self.force_remove(id).await;
    }

    async fn force_remove(&self, id: &str) {
        match tokio::time::timeout(self.cleanup_timeout, self.runtime.remove(id)).await {
            Ok(Ok(())) | Ok(Err(RuntimeError::NotFound(_))) => {
                debug!(container_id = %id, "Container removed");
            }
            Ok(Err(e)) => error!(container_id = %id, error = %e, "Failed to remove container"),
            Err(_) => error!(container_id = %id, "Timed out removing container"),
        }
    }

    /// Removes every container running the given shard, kept or not.
    #[instrument(skip(self))]
    pub async fn cancel_shard(&self, job_id: &JobId, index: u32) -> Result<(), RuntimeError> {
        let ids = self
            .runtime
            .list_by_label(JOB_LABEL, &self.job_label(job_id, index))
            .await?;
        for id in ids {
            self.force_remove(&id).await;
        }
        Ok(())
    }

    /// Removes every container this executor created. Returns how many
    /// were found.
    pub async fn cleanup_all(&self) -> Result<usize, RuntimeError> {
        let ids = self.runtime.list_by_label(EXECUTOR_LABEL, &self.id).await?;
        let count = ids.len();
        for id in ids {
            match self.runtime.remove(&id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => error!(container_id = %id, error = %e, "Failed to remove container"),
            }
        }
        if count > 0 {
            info!(count, executor_id = %self.id, "Cleaned up containers");
        }
        Ok(count)
    }
}

/// Rejects volumes the container could not mount.
fn validate_volumes(shard: &JobShard) -> Result<(), ExecutorError> {
    for volume in shard.volumes() {
        if volume.name.is_empty() {
            return Err(ExecutorError::InvalidVolume(format!(
                "input mounted at '{}' has no name",
                volume.path
            )));
        }
        if volume.path.is_empty() {
            return Err(ExecutorError::InvalidVolume(format!(
                "input '{}' has no mount path",
                volume.name
            )));
        }
    }

    for output in &shard.job.spec.outputs {
        if output.name.is_empty() {
            return Err(ExecutorError::InvalidVolume(format!(
                "output mounted at '{}' has no name",
                output.path
            )));
        }
        if output.path.is_empty() {
            return Err(ExecutorError::InvalidVolume(format!(
                "output '{}' has no mount path",
                output.name
            )));
        }
        let reserved = [STDOUT_FILE, STDERR_FILE, EXIT_CODE_FILE, ".", ".."];
        if output.name.contains('/') || reserved.contains(&output.name.as_str()) {
            return Err(ExecutorError::InvalidVolume(format!(
                "output name '{}' is not allowed",
                output.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidmesh_model::{DockerSpec, Job, OutputSpec, Spec};
    use rstest::rstest;

    fn shard_with_output(name: &str, path: &str) -> JobShard {
        let spec = Spec {
            docker: DockerSpec {
                image: "ubuntu".into(),
                ..Default::default()
            },
            outputs: vec![OutputSpec {
                name: name.into(),
                path: path.into(),
            }],
            ..Default::default()
        };
        JobShard {
            job: Job::new("client", spec),
            index: 0,
        }
    }

    #[rstest]
    #[case::ok("data", "/outputs", true)]
    #[case::no_name("", "/outputs", false)]
    #[case::no_path("data", "", false)]
    #[case::clashes_with_logs("stdout", "/outputs", false)]
    #[case::escapes_results("../up", "/outputs", false)]
    fn test_validate_outputs(#[case] name: &str, #[case] path: &str, #[case] ok: bool) {
        assert_eq!(validate_volumes(&shard_with_output(name, path)).is_ok(), ok);
    }

    #[test]
    fn test_labels_and_names() {
        let config = ComputeConfig {
            executor_id: "exec1".into(),
            ..Default::default()
        };
        let executor = ShardExecutor::new(
            &config,
            Arc::new(crate::runtime::MockRuntime::new()),
            StorageProviders::new(),
        );
        let job_id = JobId::new();
        assert_eq!(executor.job_label(&job_id, 2), format!("exec1{job_id}:2"));
        assert_eq!(
            executor.container_name(&job_id, 2),
            format!("bidmesh-exec1-{job_id}-2-executor")
        );
    }
}

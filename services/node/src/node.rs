//! Wiring of one requester and one compute node.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bidmesh_bidstrategy::{JobSelectionStrategy, ResourceCapacityStrategy};
use bidmesh_compute::{
    CapacityTracker, CleanupManager, ComputeNode, ContainerRuntime, DockerRuntime, MockRuntime,
    ShardExecutor, SystemResources,
};
use bidmesh_events::ChannelSink;
use bidmesh_model::{JobCreatePayload, JobState, ShardReport};
use bidmesh_requester::{
    HousekeepingWorker, InMemoryJobStore, JobStore, JobWaiter, RequesterEndpoint,
    SchedulingQueue, SqliteJobStore, TransformPipeline,
};
use bidmesh_storage::{
    ContentStorage, ContentStore, InlineStorage, LocalDirectoryStorage, StorageProviders,
};
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{NodeConfig, RuntimeBackend, StoreBackend};
use crate::local::{forward_reports, ChannelReporter, LocalDispatcher};

/// Opens the configured job store.
pub fn open_store(config: &NodeConfig) -> Result<Arc<dyn JobStore>> {
    Ok(match config.store {
        StoreBackend::Memory => Arc::new(InMemoryJobStore::new()),
        StoreBackend::Sqlite => {
            std::fs::create_dir_all(&config.data_dir)
                .with_context(|| format!("creating {}", config.data_dir.display()))?;
            let path = config.job_store_path();
            Arc::new(
                SqliteJobStore::open(&path)
                    .with_context(|| format!("opening job store {}", path.display()))?,
            )
        }
    })
}

/// Connects to the configured container runtime.
pub async fn connect_runtime(config: &NodeConfig) -> Result<Arc<dyn ContainerRuntime>> {
    Ok(match config.runtime {
        RuntimeBackend::Mock => Arc::new(MockRuntime::new()),
        RuntimeBackend::Docker => {
            let docker = DockerRuntime::new(&config.compute.docker_socket);
            docker.ping().await.with_context(|| {
                format!(
                    "connecting to docker at {}",
                    config.compute.docker_socket.display()
                )
            })?;
            Arc::new(docker)
        }
    })
}

/// A requester and a compute node sharing one process.
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn JobStore>,
    endpoint: Arc<RequesterEndpoint>,
    queue: Arc<SchedulingQueue>,
    compute: Arc<ComputeNode>,
    events: ChannelSink,
    cleanup: CleanupManager,
    reports: Option<mpsc::UnboundedReceiver<ShardReport>>,
}

impl Node {
    pub async fn build(
        config: NodeConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let node_id = config.node_id;
        let content = ContentStore::new(config.content_dir());
        let storage = StorageProviders::new()
            .register(Arc::new(ContentStorage::new(content.clone())))
            .register(Arc::new(InlineStorage::new(config.scratch_dir())))
            .register(Arc::new(LocalDirectoryStorage::new(
                config.allowed_local_dirs.clone(),
            )));

        let total = SystemResources::measure().capacity(&config.compute.total_capacity);
        let job_limit = config.compute.job_limit.or_defaults(&total);
        info!(cpu = total.cpu, memory = total.memory, gpu = total.gpu, "Compute capacity");
        let capacity = Arc::new(CapacityTracker::new(total));

        let executor = Arc::new(ShardExecutor::new(
            &config.compute,
            runtime,
            storage.clone(),
        ));
        let (reporter, reports) = ChannelReporter::channel();
        let compute_strategy = ResourceCapacityStrategy::new(job_limit, capacity.clone());
        let compute = Arc::new(ComputeNode::new(
            node_id,
            Arc::clone(&executor),
            Arc::new(compute_strategy),
            capacity,
            config.compute.default_job_resources,
            content.clone(),
            Arc::new(reporter),
        ));

        let events = ChannelSink::default();
        let queue = Arc::new(SchedulingQueue::new(
            node_id,
            Arc::clone(&store),
            Arc::new(LocalDispatcher::new(Arc::clone(&compute))),
            Arc::new(events.clone()),
        ));

        let public_key = match &config.public_key_path {
            Some(path) => read_key(path).await?,
            None => Vec::new(),
        };
        let transforms = TransformPipeline::standard(
            &config.requester,
            node_id,
            &public_key,
            Arc::new(content),
        );
        let selector = JobSelectionStrategy::new(
            config.requester.job_selection_policy.clone(),
            Arc::new(storage),
        );
        let endpoint = Arc::new(RequesterEndpoint::new(
            Arc::clone(&queue),
            transforms,
            Arc::new(selector),
            config.requester.job_approver.clone(),
        ));

        let cleanup = CleanupManager::new(config.compute.cleanup_timeout);
        cleanup.register("executor", move || {
            async move {
                let removed = executor.cleanup_all().await?;
                debug!(removed, "Swept executor containers");
                anyhow::Ok(())
            }
            .boxed()
        });

        Ok(Self {
            config,
            store,
            endpoint,
            queue,
            compute,
            events,
            cleanup,
            reports: Some(reports),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Arc<RequesterEndpoint> {
        &self.endpoint
    }

    pub fn compute(&self) -> &Arc<ComputeNode> {
        &self.compute
    }

    pub fn events(&self) -> &ChannelSink {
        &self.events
    }

    pub fn waiter(&self) -> JobWaiter {
        JobWaiter::new(
            Arc::clone(&self.store),
            self.config.requester.stall_check_interval,
        )
    }

    /// Starts the report forwarder and the housekeeping worker. Only the
    /// first call starts the forwarder.
    pub fn spawn_workers(&mut self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(reports) = self.reports.take() {
            handles.push(tokio::spawn(forward_reports(
                Arc::clone(&self.queue),
                reports,
                shutdown.clone(),
            )));
        }

        let housekeeping = HousekeepingWorker::new(
            Arc::clone(&self.queue),
            self.config.requester.housekeeping_interval,
            self.config.requester.default_job_execution_timeout,
        );
        handles.push(tokio::spawn(async move { housekeeping.run(shutdown).await }));

        handles
    }

    /// Submits a job file and waits for the job to finish.
    pub async fn run_job_file(&self, path: &Path) -> Result<JobState> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading job file {}", path.display()))?;
        let payload: JobCreatePayload = serde_json::from_str(&raw)
            .with_context(|| format!("parsing job file {}", path.display()))?;

        let job = self.endpoint.submit_job(payload).await?;
        info!(job_id = %job.id(), "Submitted job");
        Ok(self.waiter().wait(job.id()).await?)
    }

    /// Runs shutdown cleanup. Returns how many cleanup steps failed.
    pub async fn shutdown(&self) -> usize {
        self.cleanup.cleanup().await
    }
}

async fn read_key(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading public key {}", path.display()))
}

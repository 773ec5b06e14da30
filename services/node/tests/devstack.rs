//! Full submit → bid → run → report flow in one process.

use std::sync::Arc;
use std::time::Duration;

use bidmesh_compute::MockRuntime;
use bidmesh_events::JobEventPayload;
use bidmesh_model::{
    Deal, DockerSpec, JobCreatePayload, JobStateType, ResourceSpec, ShardStateType,
    ShardingConfig, Spec, StorageSource, StorageSpec, STDOUT_FILE,
};
use bidmesh_node::{Node, NodeConfig};
use bidmesh_requester::{CancelJobRequest, InMemoryJobStore};
use bidmesh_storage::ContentStore;
use tempfile::TempDir;
use tokio::sync::watch;

struct Devstack {
    dir: TempDir,
    runtime: Arc<MockRuntime>,
    node: Node,
    _shutdown: watch::Sender<bool>,
}

async fn devstack() -> Devstack {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::local(dir.path());
    config.requester.stall_check_interval = Duration::from_secs(5);
    config.compute.log_capture_timeout = Duration::from_secs(1);

    let runtime = Arc::new(MockRuntime::new());
    let mut node = Node::build(config, runtime.clone(), Arc::new(InMemoryJobStore::new()))
        .await
        .unwrap();
    let (shutdown, rx) = watch::channel(false);
    node.spawn_workers(rx);

    Devstack {
        dir,
        runtime,
        node,
        _shutdown: shutdown,
    }
}

fn payload(entrypoint: &[&str]) -> JobCreatePayload {
    JobCreatePayload {
        client_id: "client".into(),
        api_version: "v1".into(),
        spec: Spec {
            docker: DockerSpec {
                image: "ubuntu".into(),
                entrypoint: entrypoint.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        },
    }
}

fn inline(name: &str, data: &str) -> StorageSpec {
    StorageSpec {
        name: name.into(),
        path: format!("/inputs/{name}"),
        source: StorageSource::Inline { data: data.into() },
    }
}

#[tokio::test]
async fn test_job_runs_to_completion_and_publishes_results() {
    let stack = devstack().await;
    let mut events = stack.node.events().subscribe();

    let mut payload = payload(&["cat", "/inputs/greeting"]);
    payload.spec.inputs = vec![inline("greeting", "hello from input")];
    let job = stack.node.endpoint().submit_job(payload).await.unwrap();

    let state = stack.node.waiter().wait(job.id()).await.unwrap();
    assert_eq!(state.state, JobStateType::Completed, "{state:?}");

    let execution = state.shards[&0].executions.last().unwrap().clone();
    assert_eq!(execution.state, ShardStateType::Completed);
    let published = execution.published_result.unwrap();
    let StorageSource::Content { cid } = published.source else {
        panic!("results should be content-addressed");
    };
    let content = ContentStore::new(stack.dir.path().join("content"));
    let stored = content.locate(&cid).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(stored.join(STDOUT_FILE)).unwrap(),
        "hello from input"
    );

    let mut published_event = false;
    while let Ok(event) = events.try_recv() {
        if let JobEventPayload::ShardResultsPublished(_) = event.payload {
            published_event = true;
        }
    }
    assert!(published_event);
    assert!(stack.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_sharded_job_completes_every_shard() {
    let stack = devstack().await;

    let mut payload = payload(&["echo", "shard"]);
    payload.spec.deal = Deal { concurrency: 2 };
    payload.spec.sharding = Some(ShardingConfig { batch_size: 1 });
    payload.spec.inputs = vec![inline("a", "first"), inline("b", "second")];
    let job = stack.node.endpoint().submit_job(payload).await.unwrap();

    let state = stack.node.waiter().wait(job.id()).await.unwrap();
    assert_eq!(state.state, JobStateType::Completed, "{state:?}");
    assert_eq!(state.shards.len(), 2);
}

#[tokio::test]
async fn test_oversized_job_is_declined_by_compute() {
    let stack = devstack().await;

    let mut payload = payload(&["true"]);
    payload.spec.resources = ResourceSpec {
        cpu: "100000".into(),
        ..Default::default()
    };
    let job = stack.node.endpoint().submit_job(payload).await.unwrap();

    let state = stack.node.waiter().wait(job.id()).await.unwrap();
    assert_eq!(state.state, JobStateType::Error);
    let reason = state.reason.unwrap();
    assert!(reason.contains("bid_rejected"), "{reason}");
    assert!(reason.contains("exceeds"), "{reason}");
}

#[tokio::test]
async fn test_failing_container_marks_job_error() {
    let stack = devstack().await;
    let job = stack
        .node
        .endpoint()
        .submit_job(payload(&["no-such-binary"]))
        .await
        .unwrap();

    let state = stack.node.waiter().wait(job.id()).await.unwrap();
    assert_eq!(state.state, JobStateType::Error);
    assert!(state.reason.unwrap().contains("executable file not found"));
    assert!(stack.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_cancel_tears_down_running_container() {
    let stack = devstack().await;
    let job = stack
        .node
        .endpoint()
        .submit_job(payload(&["sleep", "30"]))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while stack.runtime.containers().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let result = stack
        .node
        .endpoint()
        .cancel_job(CancelJobRequest::by_user(*job.id(), "changed my mind"))
        .await
        .unwrap();
    assert_eq!(result.state.state, JobStateType::Cancelled);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !stack.runtime.containers().is_empty() || stack.node.compute().running_shards() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (_, state) = stack.node.endpoint().get_job(job.id()).await.unwrap();
    assert_eq!(state.state, JobStateType::Cancelled);
}

#[tokio::test]
async fn test_shutdown_sweeps_kept_containers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::local(dir.path());
    config.compute.keep_stack = true;
    let runtime = Arc::new(MockRuntime::new());
    let mut node = Node::build(config, runtime.clone(), Arc::new(InMemoryJobStore::new()))
        .await
        .unwrap();
    let (_shutdown, rx) = watch::channel(false);
    node.spawn_workers(rx);

    let job = node.endpoint().submit_job(payload(&["true"])).await.unwrap();
    let state = node.waiter().wait(job.id()).await.unwrap();
    assert_eq!(state.state, JobStateType::Completed);
    assert_eq!(runtime.containers().len(), 1);

    assert_eq!(node.shutdown().await, 0);
    assert!(runtime.containers().is_empty());
}

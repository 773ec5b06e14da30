//! Shard execution against the in-memory runtime.

use std::sync::Arc;
use std::time::Duration;

use bidmesh_compute::{ComputeConfig, MockRuntime, ShardExecutor, JOB_SPEC_ENV};
use bidmesh_model::{
    DockerSpec, Job, JobShard, OutputSpec, RunResult, Spec, StorageSource, StorageSpec,
    EXIT_CODE_FILE, STDERR_FILE, STDOUT_FILE,
};
use async_trait::async_trait;
use bidmesh_model::StorageSourceType;
use bidmesh_storage::{InlineStorage, PreparedStorage, StorageError, StorageProvider, StorageProviders};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    dir: TempDir,
    runtime: Arc<MockRuntime>,
    executor: ShardExecutor,
}

fn harness_with(runtime: MockRuntime, keep_stack: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = ComputeConfig {
        executor_id: "test-exec".into(),
        results_dir: dir.path().join("results"),
        keep_stack,
        log_capture_timeout: Duration::from_secs(1),
        cleanup_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let runtime = Arc::new(runtime);
    let storage = StorageProviders::new().register(Arc::new(InlineStorage::new(dir.path().join("scratch"))));
    let executor = ShardExecutor::new(&config, runtime.clone(), storage);
    Harness {
        dir,
        runtime,
        executor,
    }
}

fn harness() -> Harness {
    harness_with(MockRuntime::new(), false)
}

fn shard(image: &str, entrypoint: &[&str]) -> JobShard {
    let spec = Spec {
        docker: DockerSpec {
            image: image.into(),
            entrypoint: entrypoint.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        ..Default::default()
    };
    JobShard {
        job: Job::new("client", spec),
        index: 0,
    }
}

fn read(result: &RunResult, which: &str) -> String {
    let path = match which {
        STDOUT_FILE => result.stdout_path.as_ref(),
        _ => result.stderr_path.as_ref(),
    };
    std::fs::read_to_string(path.unwrap()).unwrap()
}

#[tokio::test]
async fn test_echo_captures_stdout() {
    let h = harness();
    let shard = shard("ubuntu", &["echo", "-n", "hello"]);

    let result = h.executor.run_shard(&shard, CancellationToken::new()).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(read(&result, STDOUT_FILE), "hello");
    assert_eq!(read(&result, STDERR_FILE), "");

    let results = h.executor.shard_results_dir(shard.job.id(), 0);
    assert_eq!(std::fs::read_to_string(results.join(EXIT_CODE_FILE)).unwrap(), "0");
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_non_zero_exit_keeps_stderr() {
    let h = harness();
    let result = h
        .executor
        .run_shard(&shard("ubuntu", &["cat", "/missing"]), CancellationToken::new())
        .await;

    assert!(!result.is_success());
    assert_eq!(result.exit_code, Some(1));
    assert!(result.error.is_none());
    assert!(read(&result, STDERR_FILE).contains("No such file"));
}

#[tokio::test]
async fn test_bad_entrypoint_leaves_nothing_behind() {
    let h = harness();
    let result = h
        .executor
        .run_shard(&shard("ubuntu", &["no-such-binary"]), CancellationToken::new())
        .await;

    assert_eq!(result.exit_code, None);
    assert_eq!(result.error.as_deref(), Some("executable file not found"));
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_missing_image_fails_before_create() {
    let h = harness_with(MockRuntime::new().without_image("ghost"), false);
    let result = h
        .executor
        .run_shard(&shard("ghost", &["true"]), CancellationToken::new())
        .await;

    let error = result.error.unwrap();
    assert!(error.contains("failed to pull image ghost"), "{error}");
    assert!(error.contains("authorized"));
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_cancel_unblocks_wait_and_removes_container() {
    let h = harness();
    let cancel = CancellationToken::new();
    let shard = shard("ubuntu", &["sleep", "30"]);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        h.executor.run_shard(&shard, cancel),
    )
    .await
    .unwrap();

    assert_eq!(result.exit_code, None);
    assert_eq!(result.error.as_deref(), Some("shard execution cancelled"));
    assert!(result.stdout_path.unwrap().exists());
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_inputs_mounted_and_outputs_collected() {
    let h = harness();
    let mut shard = shard("ubuntu", &["cp", "/inputs/greeting.txt", "/outputs/copy.txt"]);
    shard.job.spec.inputs = vec![StorageSpec {
        name: "greeting".into(),
        path: "/inputs/greeting.txt".into(),
        source: StorageSource::Inline {
            data: "hello from inputs".into(),
        },
    }];
    shard.job.spec.outputs = vec![OutputSpec {
        name: "out".into(),
        path: "/outputs".into(),
    }];

    let result = h.executor.run_shard(&shard, CancellationToken::new()).await;
    assert!(result.is_success(), "{result:?}");

    let copied = h
        .executor
        .shard_results_dir(shard.job.id(), 0)
        .join("out")
        .join("copy.txt");
    assert_eq!(std::fs::read_to_string(copied).unwrap(), "hello from inputs");
}

#[tokio::test]
async fn test_inputs_are_read_only() {
    let h = harness();
    let mut shard = shard("ubuntu", &["cp", "/inputs/a.txt", "/inputs/b.txt"]);
    shard.job.spec.inputs = vec![StorageSpec {
        name: "a".into(),
        path: "/inputs/a.txt".into(),
        source: StorageSource::Inline { data: "a".into() },
    }];

    let result = h.executor.run_shard(&shard, CancellationToken::new()).await;
    assert_eq!(result.exit_code, Some(1));
}

#[tokio::test]
async fn test_job_spec_is_injected() {
    let h = harness_with(MockRuntime::new(), true);
    let shard = shard("ubuntu", &["true"]);
    h.executor.run_shard(&shard, CancellationToken::new()).await;

    let containers = h.runtime.containers();
    assert_eq!(containers.len(), 1);
    let env = &containers[0].config.env;
    let injected = env
        .iter()
        .find_map(|e| e.strip_prefix(&format!("{JOB_SPEC_ENV}=")))
        .unwrap();
    let job: Job = serde_json::from_str(injected).unwrap();
    assert_eq!(job.id(), shard.job.id());
}

#[tokio::test]
async fn test_cleanup_all_sweeps_kept_containers() {
    let h = harness_with(MockRuntime::new(), true);
    for index in 0..2 {
        let mut shard = shard("ubuntu", &["true"]);
        shard.index = index;
        h.executor.run_shard(&shard, CancellationToken::new()).await;
    }
    assert_eq!(h.runtime.containers().len(), 2);

    assert_eq!(h.executor.cleanup_all().await.unwrap(), 2);
    assert!(h.runtime.containers().is_empty());
    assert!(h.dir.path().join("results").exists());
}

#[tokio::test]
async fn test_cancel_shard_only_touches_that_shard() {
    let h = harness_with(MockRuntime::new(), true);
    let first = shard("ubuntu", &["true"]);
    let second = shard("ubuntu", &["true"]);
    h.executor.run_shard(&first, CancellationToken::new()).await;
    h.executor.run_shard(&second, CancellationToken::new()).await;

    h.executor.cancel_shard(first.job.id(), 0).await.unwrap();

    let left = h.runtime.containers();
    assert_eq!(left.len(), 1);
    assert!(left[0].config.name.contains(&second.job.id().to_string()));
}

#[tokio::test]
async fn test_cancelled_shard_never_creates_container() {
    let h = harness_with(MockRuntime::new(), true);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h.executor.run_shard(&shard("ubuntu", &["true"]), cancel).await;

    assert_eq!(result.error.as_deref(), Some("shard execution cancelled"));
    assert!(h.runtime.containers().is_empty());
}

/// Content that never arrives.
struct StalledStorage;

#[async_trait]
impl StorageProvider for StalledStorage {
    fn source_type(&self) -> StorageSourceType {
        StorageSourceType::Content
    }

    async fn has_storage_locally(&self, _spec: &StorageSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn prepare(&self, _spec: &StorageSpec) -> Result<PreparedStorage, StorageError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_slow_storage_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = ComputeConfig {
        results_dir: dir.path().join("results"),
        storage_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let runtime = Arc::new(MockRuntime::new());
    let storage = StorageProviders::new().register(Arc::new(StalledStorage));
    let executor = ShardExecutor::new(&config, runtime.clone(), storage);

    let mut shard = shard("ubuntu", &["true"]);
    shard.job.spec.inputs = vec![StorageSpec {
        name: "data".into(),
        path: "/inputs".into(),
        source: StorageSource::Content {
            cid: "sha256-missing".into(),
        },
    }];

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        executor.run_shard(&shard, CancellationToken::new()),
    )
    .await
    .unwrap();

    let error = result.error.unwrap();
    assert!(error.contains("timed out preparing storage"), "{error}");
    assert!(runtime.containers().is_empty());
}

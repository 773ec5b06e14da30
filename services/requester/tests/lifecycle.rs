//! End-to-end job lifecycle through the requester endpoint.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bidmesh_bidstrategy::{BidStrategyResponse, FixedStrategy};
use bidmesh_events::{ChannelSink, JobEventPayload};
use bidmesh_id::{JobId, NodeId};
use bidmesh_model::{
    DockerSpec, Job, JobCreatePayload, JobStateType, RunResult, ShardReport, ShardReportKind,
    Spec, StorageSource, StorageSpec,
};
use bidmesh_requester::{
    ApproveJobRequest, CancelJobRequest, DispatchError, RequesterConfig, RequesterEndpoint,
    RequesterError, SchedulingQueue, ShardDispatcher, SqliteJobStore, TransformPipeline,
};
use bidmesh_storage::ContentStore;

#[derive(Default)]
struct Dispatched {
    jobs: Mutex<Vec<Job>>,
    cancels: Mutex<Vec<JobId>>,
}

#[async_trait]
impl ShardDispatcher for Dispatched {
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn cancel(&self, job_id: &JobId, _reason: &str) -> Result<(), DispatchError> {
        self.cancels.lock().unwrap().push(*job_id);
        Ok(())
    }
}

struct Harness {
    endpoint: RequesterEndpoint,
    queue: Arc<SchedulingQueue>,
    dispatched: Arc<Dispatched>,
    events: ChannelSink,
    content: ContentStore,
    _dir: tempfile::TempDir,
}

fn harness(response: BidStrategyResponse, approver: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let content = ContentStore::new(dir.path().join("content"));
    let store = SqliteJobStore::open(dir.path().join("jobs.db")).unwrap();
    let dispatched = Arc::new(Dispatched::default());
    let events = ChannelSink::default();
    let node_id = NodeId::new();

    let queue = Arc::new(SchedulingQueue::new(
        node_id,
        Arc::new(store),
        dispatched.clone(),
        Arc::new(events.clone()),
    ));
    let transforms = TransformPipeline::standard(
        &RequesterConfig::default(),
        node_id,
        b"requester-key",
        Arc::new(content.clone()),
    );
    let endpoint = RequesterEndpoint::new(
        queue.clone(),
        transforms,
        Arc::new(FixedStrategy::new(response)),
        approver,
    );

    Harness {
        endpoint,
        queue,
        dispatched,
        events,
        content,
        _dir: dir,
    }
}

fn payload() -> JobCreatePayload {
    JobCreatePayload {
        client_id: "client".into(),
        api_version: "v1".into(),
        spec: Spec {
            docker: DockerSpec {
                image: "ubuntu".into(),
                entrypoint: vec!["echo".into(), "hello".into()],
                ..Default::default()
            },
            ..Default::default()
        },
    }
}

async fn state(h: &Harness, job: &Job) -> JobStateType {
    h.endpoint.get_job(job.id()).await.unwrap().1.state
}

#[tokio::test]
async fn submitted_jobs_get_unique_ids() {
    let h = harness(BidStrategyResponse::bid(), "");
    let mut ids = HashSet::new();
    for _ in 0..20 {
        let job = h.endpoint.submit_job(payload()).await.unwrap();
        assert!(ids.insert(*job.id()));
    }
}

#[tokio::test]
async fn submission_persists_transformed_job() {
    let h = harness(BidStrategyResponse::bid(), "");
    let mut submission = payload();
    submission.spec.inputs.push(StorageSpec {
        name: "greeting".into(),
        path: "/inputs/greeting".into(),
        source: StorageSource::Inline {
            data: "hi there".into(),
        },
    });

    let job = h.endpoint.submit_job(submission).await.unwrap();
    let (stored, _) = h.endpoint.get_job(job.id()).await.unwrap();
    assert_eq!(stored, job);

    let StorageSource::Content { cid } = &stored.spec.inputs[0].source else {
        panic!("inline input was persisted");
    };
    assert!(h.content.locate(cid).await.is_some());
    assert!(stored.requester.is_some());
    assert_eq!(stored.spec.timeout_secs, Some(30 * 60));
    assert_eq!(h.dispatched.jobs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_job_is_cancelled_with_reason() {
    let h = harness(BidStrategyResponse::reject("no gpus"), "");
    let job = h.endpoint.submit_job(payload()).await.unwrap();

    let (_, job_state) = h.endpoint.get_job(job.id()).await.unwrap();
    assert_eq!(job_state.state, JobStateType::Cancelled);
    assert_eq!(job_state.reason.as_deref(), Some("job rejected: no gpus"));
    assert!(h.dispatched.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_is_idempotent_for_non_terminal_jobs() {
    let h = harness(BidStrategyResponse::bid(), "");
    let job = h.endpoint.submit_job(payload()).await.unwrap();

    let first = h
        .endpoint
        .cancel_job(CancelJobRequest::by_user(*job.id(), "stop"))
        .await
        .unwrap();
    assert!(!first.already_cancelled);

    let second = h
        .endpoint
        .cancel_job(CancelJobRequest::by_user(*job.id(), "stop again"))
        .await
        .unwrap();
    assert!(second.already_cancelled);
    assert_eq!(second.state.version, first.state.version);
    assert_eq!(second.state.reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn cancel_of_finished_job_fails_without_mutation() {
    let h = harness(BidStrategyResponse::bid(), "");
    let job = h.endpoint.submit_job(payload()).await.unwrap();
    h.queue
        .report_shard(ShardReport {
            job_id: *job.id(),
            node_id: NodeId::new(),
            shard_index: 0,
            kind: ShardReportKind::Completed {
                run_result: RunResult {
                    exit_code: Some(0),
                    ..Default::default()
                },
                published: None,
            },
        })
        .await
        .unwrap();
    let (_, before) = h.endpoint.get_job(job.id()).await.unwrap();
    assert_eq!(before.state, JobStateType::Completed);

    let err = h
        .endpoint
        .cancel_job(CancelJobRequest::by_user(*job.id(), "too late"))
        .await
        .unwrap_err();
    assert!(err.is_state_conflict());

    let (_, after) = h.endpoint.get_job(job.id()).await.unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn concurrent_cancels_transition_once() {
    let h = harness(BidStrategyResponse::bid(), "");
    let job = h.endpoint.submit_job(payload()).await.unwrap();
    assert_eq!(state(&h, &job).await, JobStateType::Running);
    let mut events = h.events.subscribe();

    let (a, b) = tokio::join!(
        h.endpoint
            .cancel_job(CancelJobRequest::by_user(*job.id(), "first")),
        h.endpoint
            .cancel_job(CancelJobRequest::by_user(*job.id(), "second")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.already_cancelled != b.already_cancelled);
    assert_eq!(state(&h, &job).await, JobStateType::Cancelled);
    assert_eq!(h.dispatched.cancels.lock().unwrap().len(), 1);

    let mut transitions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event.payload, JobEventPayload::JobStateChanged(_)) {
            transitions += 1;
        }
    }
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn approval_fails_closed() {
    let open = harness(BidStrategyResponse::wait("manual"), "");
    let job = open.endpoint.submit_job(payload()).await.unwrap();

    for client_id in ["", "anyone"] {
        let err = open
            .endpoint
            .approve_job(ApproveJobRequest {
                client_id: client_id.into(),
                job_id: *job.id(),
                response: BidStrategyResponse::bid(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RequesterError::Unauthorized));
    }
    assert_eq!(state(&open, &job).await, JobStateType::Bidding);

    let guarded = harness(BidStrategyResponse::wait("manual"), "ops");
    let job = guarded.endpoint.submit_job(payload()).await.unwrap();
    let err = guarded
        .endpoint
        .approve_job(ApproveJobRequest {
            client_id: "".into(),
            job_id: *job.id(),
            response: BidStrategyResponse::bid(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RequesterError::Unauthorized));

    guarded
        .endpoint
        .approve_job(ApproveJobRequest {
            client_id: "ops".into(),
            job_id: *job.id(),
            response: BidStrategyResponse::reject("not this one"),
        })
        .await
        .unwrap();
    assert_eq!(state(&guarded, &job).await, JobStateType::Cancelled);
}

//! End-to-end tests for pipeline subscriptions and blocking state waits.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use sluice_core::{JobId, PipelineName, init_logging};
use sluice_persist::job::{JobInfo, JobState, JobStateUpdate};
use sluice_persist::pipeline::{
    PipelineChangeKind, PipelineInfo, PipelineState, PipelineStateUpdate, PipelineStoppedUpdate,
};
use sluice_persist::service::PersistService;
use sluice_persist::store::memory::InMemoryStore;

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(100);

async fn service() -> PersistService {
    init_logging(sluice_core::LogFormat::Pretty);
    let service = PersistService::new(Arc::new(InMemoryStore::new()), "sluice");
    service.schema().initialize().await.unwrap();
    service
}

/// A shard-filtered subscriber sees creates, updates, and deletes for its
/// shard, and nothing for other shards or for pure state transitions.
#[tokio::test]
async fn subscription_delivers_lifecycle_events_for_its_shard() {
    let service = service().await;
    let pipelines = service.pipelines();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p0"), 0))
        .await
        .unwrap();

    let mut feed = pipelines.subscribe_pipeline_infos(Some(0), true).await.unwrap();

    // Initial replay of the pre-existing pipeline.
    let initial = timeout(WAIT, feed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(initial.kind, PipelineChangeKind::Create);
    assert_eq!(initial.pipeline.pipeline_name, PipelineName::new("p0"));

    // A pipeline on another shard is invisible.
    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p-elsewhere"), 1))
        .await
        .unwrap();

    // A pure state transition is projected out of the stream.
    pipelines
        .update_pipeline_state(PipelineStateUpdate {
            pipeline_name: PipelineName::new("p0"),
            state: PipelineState::Running,
        })
        .await
        .unwrap();

    // A real descriptor change comes through as an update.
    let mut update = PipelineInfo::new(PipelineName::new("p0"), 0);
    update.stopped = true;
    pipelines.update_pipeline_info(update).await.unwrap();

    let change = timeout(WAIT, feed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(change.kind, PipelineChangeKind::Update);
    assert!(change.pipeline.stopped);

    pipelines
        .delete_pipeline_info(&PipelineName::new("p0"))
        .await
        .unwrap();
    let gone = timeout(WAIT, feed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(gone.kind, PipelineChangeKind::Delete);
    assert_eq!(gone.pipeline.pipeline_name, PipelineName::new("p0"));
}

/// Without initial replay, only live changes are delivered.
#[tokio::test]
async fn subscription_without_initial_skips_existing_pipelines() {
    let service = service().await;
    let pipelines = service.pipelines();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p0"), 0))
        .await
        .unwrap();

    let mut feed = pipelines
        .subscribe_pipeline_infos(None, false)
        .await
        .unwrap();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p1"), 0))
        .await
        .unwrap();

    let change = timeout(WAIT, feed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(change.kind, PipelineChangeKind::Create);
    assert_eq!(change.pipeline.pipeline_name, PipelineName::new("p1"));
}

/// A blocked state wait resolves when a concurrent update reaches the
/// requested state.
#[tokio::test]
async fn block_pipeline_state_unblocks_on_update() {
    let service = service().await;
    let pipelines = service.pipelines();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p0"), 0))
        .await
        .unwrap();

    let waiting = tokio::spawn({
        let pipelines = pipelines.clone();
        async move {
            pipelines
                .block_pipeline_state(&PipelineName::new("p0"), PipelineState::Running)
                .await
        }
    });
    tokio::time::sleep(SETTLE).await;
    assert!(!waiting.is_finished());

    pipelines
        .update_pipeline_state(PipelineStateUpdate {
            pipeline_name: PipelineName::new("p0"),
            state: PipelineState::Running,
        })
        .await
        .unwrap();

    let info = timeout(WAIT, waiting).await.unwrap().unwrap().unwrap();
    assert_eq!(info.state, PipelineState::Running);
    assert_eq!(info.pipeline_name, PipelineName::new("p0"));
}

/// A wait on a state the pipeline already has resolves immediately.
#[tokio::test]
async fn block_pipeline_state_sees_current_state() {
    let service = service().await;
    let pipelines = service.pipelines();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p0"), 0))
        .await
        .unwrap();

    let info = timeout(
        WAIT,
        pipelines.block_pipeline_state(&PipelineName::new("p0"), PipelineState::Starting),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(info.state, PipelineState::Starting);
}

/// The creation timestamp survives updates that carry new field values.
#[tokio::test]
async fn created_at_survives_updates() {
    let service = service().await;
    let pipelines = service.pipelines();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p0"), 0))
        .await
        .unwrap();
    let t0 = pipelines
        .get_pipeline_info(&PipelineName::new("p0"))
        .await
        .unwrap()
        .created_at
        .unwrap();

    let mut update = PipelineInfo::new(PipelineName::new("p0"), 4);
    update.stopped = true;
    pipelines.update_pipeline_info(update).await.unwrap();
    pipelines
        .update_pipeline_stopped(PipelineStoppedUpdate {
            pipeline_name: PipelineName::new("p0"),
            stopped: false,
        })
        .await
        .unwrap();

    let after = pipelines
        .get_pipeline_info(&PipelineName::new("p0"))
        .await
        .unwrap();
    assert_eq!(after.created_at, Some(t0));
    assert_eq!(after.shard, 4);
    assert!(!after.stopped);
}

/// Job counts are folded per request from the pipeline's jobs.
#[tokio::test]
async fn get_pipeline_info_derives_job_counts() {
    let service = service().await;
    let pipelines = service.pipelines();
    let jobs = service.jobs();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p0"), 0))
        .await
        .unwrap();
    for id in ["j1", "j2", "j3"] {
        jobs.create_job_info(JobInfo::new(
            JobId::new(id),
            Some(PipelineName::new("p0")),
            vec![],
        ))
        .await
        .unwrap();
    }
    jobs.create_job_info(JobInfo::new(
        JobId::new("other"),
        Some(PipelineName::new("p1")),
        vec![],
    ))
    .await
    .unwrap();
    jobs.create_job_state(JobStateUpdate::new(JobId::new("j3"), JobState::Success))
        .await
        .unwrap();

    let info = pipelines
        .get_pipeline_info(&PipelineName::new("p0"))
        .await
        .unwrap();
    assert_eq!(info.job_counts.get(&JobState::Creating), Some(&2));
    assert_eq!(info.job_counts.get(&JobState::Success), Some(&1));
    assert_eq!(info.job_counts.values().sum::<u64>(), 3);
}

/// Wiping the registries clears jobs and pipelines but not chunks.
#[tokio::test]
async fn delete_all_clears_jobs_and_pipelines_only() {
    let service = service().await;
    let pipelines = service.pipelines();
    let jobs = service.jobs();
    let chunks = service.chunks();

    pipelines
        .create_pipeline_info(PipelineInfo::new(PipelineName::new("p0"), 0))
        .await
        .unwrap();
    jobs.create_job_info(JobInfo::new(
        JobId::new("j1"),
        Some(PipelineName::new("p0")),
        vec![],
    ))
    .await
    .unwrap();
    chunks
        .add_chunks(vec![sluice_persist::chunk::Chunk::new(
            sluice_core::ChunkId::new("k1"),
            JobId::new("j1"),
        )])
        .await
        .unwrap();

    pipelines.delete_all().await.unwrap();

    assert!(jobs.list_job_infos(None, &[]).await.unwrap().is_empty());
    assert!(pipelines.list_pipeline_infos(None).await.unwrap().is_empty());
    // Chunks survive; their claim feed still offers them.
    let claimed = timeout(
        WAIT,
        chunks.claim_chunk(&JobId::new("j1"), &sluice_persist::chunk::Pod::new("pod-a")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(claimed.id, sluice_core::ChunkId::new("k1"));
}

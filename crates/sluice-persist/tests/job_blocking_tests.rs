//! End-to-end tests for blocking job inspection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use sluice_core::JobId;
use sluice_persist::job::{Commit, JobInfo, JobInput, JobState, JobStateUpdate};
use sluice_persist::service::PersistService;
use sluice_persist::store::memory::InMemoryStore;

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(100);

async fn service() -> PersistService {
    let service = PersistService::new(Arc::new(InMemoryStore::new()), "sluice");
    service.schema().initialize().await.unwrap();
    service
}

/// A blocking inspect parks until the job reaches a terminal state, then
/// returns the terminal record.
#[tokio::test]
async fn blocking_inspect_waits_for_terminal_state() {
    let service = service().await;
    let jobs = service.jobs();

    jobs.create_job_info(JobInfo::new(
        JobId::new("j1"),
        None,
        vec![JobInput::new(Commit::new("r", "c"))],
    ))
    .await
    .unwrap();

    let waiting = tokio::spawn({
        let jobs = jobs.clone();
        async move { jobs.inspect_job(&JobId::new("j1"), true).await }
    });

    // RUNNING is not terminal; the waiter must not resolve on it.
    jobs.create_job_state(JobStateUpdate::new(JobId::new("j1"), JobState::Running))
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    assert!(!waiting.is_finished());

    jobs.create_job_state(JobStateUpdate::new(JobId::new("j1"), JobState::Failure))
        .await
        .unwrap();

    let job = timeout(WAIT, waiting).await.unwrap().unwrap().unwrap();
    assert_eq!(job.state, JobState::Failure);
    assert!(job.finished.is_some());
}

/// A job already in a terminal state resolves immediately via the initial
/// replay.
#[tokio::test]
async fn blocking_inspect_sees_already_terminal_job() {
    let service = service().await;
    let jobs = service.jobs();

    jobs.create_job_info(JobInfo::new(JobId::new("j1"), None, vec![]))
        .await
        .unwrap();
    jobs.create_job_state(JobStateUpdate::new(JobId::new("j1"), JobState::Empty))
        .await
        .unwrap();

    let job = timeout(WAIT, jobs.inspect_job(&JobId::new("j1"), true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Empty);
    // EMPTY resolves the wait but is not a completion.
    assert!(job.finished.is_none());
}

/// The created record and the inspected record are the same value.
#[tokio::test]
async fn inspect_returns_the_creation_response() {
    let service = service().await;
    let jobs = service.jobs();

    let created = jobs
        .create_job_info(JobInfo::new(
            JobId::new("j1"),
            None,
            vec![
                JobInput::new(Commit::new("r2", "c2")),
                JobInput::new(Commit::new("r1", "c1")),
            ],
        ))
        .await
        .unwrap();

    let inspected = jobs.inspect_job(&JobId::new("j1"), false).await.unwrap();
    assert_eq!(inspected, created);
    assert_eq!(inspected.started, created.started);
    assert_eq!(inspected.commit_index, "r1/c1r2/c2");
}

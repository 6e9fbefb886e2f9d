//! Job registry: point lookups, filtered lists, and blocking waits over
//! job descriptors.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use sluice_core::{Error, JobId, PipelineName, Result};

use crate::job::{Commit, JobInfo, JobOutputUpdate, JobState, JobStateUpdate, commit_index};
use crate::schema;
use crate::store::{
    DocumentStore, FeedOptions, OnConflict, Selector, from_document, to_document,
};

/// Stores and serves job descriptors on a shared store session.
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn DocumentStore>,
    database: String,
}

impl JobRegistry {
    /// Creates a registry over the given session and database.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, database: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
        }
    }

    /// Creates a job descriptor.
    ///
    /// Stamps `started` and derives `commit_index` from the inputs; both
    /// must be unset on the request. Returns the record as inserted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty `job_id` or a
    /// pre-set server-controlled field, and [`Error::Conflict`] for a
    /// duplicate `job_id`.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.job_id))]
    pub async fn create_job_info(&self, mut job: JobInfo) -> Result<JobInfo> {
        if job.job_id.is_empty() {
            return Err(Error::invalid_argument("job_id must be set"));
        }
        if job.started.is_some() {
            return Err(Error::invalid_argument("started must be unset"));
        }
        if !job.commit_index.is_empty() {
            return Err(Error::invalid_argument("commit_index must be unset"));
        }
        job.started = Some(Utc::now());
        job.commit_index = commit_index(&job.input_commits())?;

        let doc = to_document(&job)?;
        self.store
            .insert(&self.database, schema::JOB_INFOS, vec![doc], OnConflict::Error)
            .await?;
        Ok(job)
    }

    /// Returns the job's current record, or, with `block_state`, waits on
    /// the job's change-feed until it reaches `EMPTY`, `SUCCESS`, or
    /// `FAILURE` and returns that record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the job does not exist (waiting on
    /// a missing job fails instead of hanging), and [`Error::Canceled`] if
    /// the feed closes before a terminal state is seen.
    #[tracing::instrument(skip(self), fields(job_id = %job_id, block_state))]
    pub async fn inspect_job(&self, job_id: &JobId, block_state: bool) -> Result<JobInfo> {
        if !block_state {
            let doc = self
                .store
                .get(&self.database, schema::JOB_INFOS, job_id.as_str())
                .await?
                .ok_or_else(|| Error::not_found("job", job_id))?;
            return from_document(doc);
        }

        let options = FeedOptions {
            selector: Selector::new().field(schema::JOB_PRIMARY_KEY, job_id.as_str()),
            include_initial: true,
            ..FeedOptions::default()
        };
        let mut feed = self
            .store
            .changefeed(&self.database, schema::JOB_INFOS, options)
            .await?;

        // Probe after the cursor is open so a job racing into existence is
        // still caught by the live feed.
        if self
            .store
            .get(&self.database, schema::JOB_INFOS, job_id.as_str())
            .await?
            .is_none()
        {
            return Err(Error::not_found("job", job_id));
        }

        while let Some(event) = feed.next().await? {
            let Some(doc) = event.new else { continue };
            let job: JobInfo = from_document(doc)?;
            if job.state.is_terminal() {
                return Ok(job);
            }
        }
        Err(Error::canceled("inspect_job"))
    }

    /// Lists jobs, choosing the most selective index for the given filters.
    ///
    /// Both filters use the compound `(pipeline, fingerprint)` index, one
    /// filter its single index, and no filter a full scan. Results come
    /// back in index order; no further ordering is promised.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if any filter commit has an
    /// empty ID.
    #[tracing::instrument(skip(self, input_commits), fields(pipeline = ?pipeline.map(PipelineName::as_str)))]
    pub async fn list_job_infos(
        &self,
        pipeline: Option<&PipelineName>,
        input_commits: &[Commit],
    ) -> Result<Vec<JobInfo>> {
        let fingerprint = commit_index(input_commits)?;
        let docs = match (pipeline, !input_commits.is_empty()) {
            (Some(pipeline), true) => {
                self.store
                    .get_all(
                        &self.database,
                        schema::JOB_INFOS,
                        schema::INDEX_PIPELINE_NAME_AND_COMMIT_INDEX,
                        &json!([pipeline.as_str(), fingerprint]),
                    )
                    .await?
            }
            (Some(pipeline), false) => {
                self.store
                    .get_all(
                        &self.database,
                        schema::JOB_INFOS,
                        schema::INDEX_PIPELINE_NAME,
                        &json!(pipeline.as_str()),
                    )
                    .await?
            }
            (None, true) => {
                self.store
                    .get_all(
                        &self.database,
                        schema::JOB_INFOS,
                        schema::INDEX_COMMIT_INDEX,
                        &json!(fingerprint),
                    )
                    .await?
            }
            (None, false) => self.store.scan(&self.database, schema::JOB_INFOS).await?,
        };
        docs.into_iter().map(from_document).collect()
    }

    /// Deletes a job descriptor. Succeeds if the job is already gone.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn delete_job_info(&self, job_id: &JobId) -> Result<()> {
        self.store
            .delete(&self.database, schema::JOB_INFOS, job_id.as_str())
            .await
    }

    /// Deletes every job owned by the pipeline. Succeeds if none match.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self), fields(pipeline = %pipeline))]
    pub async fn delete_job_infos_for_pipeline(&self, pipeline: &PipelineName) -> Result<()> {
        let removed = self
            .store
            .delete_all_by_index(
                &self.database,
                schema::JOB_INFOS,
                schema::INDEX_PIPELINE_NAME,
                &json!(pipeline.as_str()),
            )
            .await?;
        tracing::debug!(removed, "deleted pipeline jobs");
        Ok(())
    }

    /// Applies a state transition to a stored job.
    ///
    /// Stamps `finished` when the new state is `SUCCESS` or `FAILURE`;
    /// the caller must leave it unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `finished` is pre-set.
    #[tracing::instrument(skip(self, update), fields(job_id = %update.job_id, state = %update.state))]
    pub async fn create_job_state(&self, mut update: JobStateUpdate) -> Result<()> {
        if update.finished.is_some() {
            return Err(Error::invalid_argument("finished must be unset"));
        }
        if update.state.is_finished() {
            update.finished = Some(Utc::now());
        }
        let doc = to_document(&update)?;
        self.store
            .insert(&self.database, schema::JOB_INFOS, vec![doc], OnConflict::Merge)
            .await
    }

    /// Attaches an output commit to a stored job; other fields untouched.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self, update), fields(job_id = %update.job_id))]
    pub async fn create_job_output(&self, update: JobOutputUpdate) -> Result<()> {
        let doc = to_document(&update)?;
        self.store
            .insert(&self.database, schema::JOB_INFOS, vec![doc], OnConflict::Merge)
            .await
    }

    /// Atomically moves the job from `PULLING` to `RUNNING`.
    ///
    /// A job in any other state is left untouched. Either way the job's
    /// post-call record is returned; callers distinguish the two outcomes
    /// by inspecting its state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the job does not exist.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn start_job(&self, job_id: &JobId) -> Result<JobInfo> {
        let changed = self
            .store
            .mutate(
                &self.database,
                schema::JOB_INFOS,
                job_id.as_str(),
                Box::new(|doc| {
                    if doc.get("state").and_then(Value::as_str)
                        != Some(JobState::Pulling.as_str())
                    {
                        return None;
                    }
                    let mut next = doc.clone();
                    next.insert("state".into(), JobState::Running.as_str().into());
                    Some(next)
                }),
            )
            .await?;

        match changed {
            Some(doc) => from_document(doc),
            None => {
                let doc = self
                    .store
                    .get(&self.database, schema::JOB_INFOS, job_id.as_str())
                    .await?
                    .ok_or_else(|| Error::not_found("job", job_id))?;
                from_document(doc)
            }
        }
    }
}

//! Pipeline registry: descriptor storage, shard-filtered listings, change
//! subscriptions, and blocking state waits.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use serde_json::json;

use sluice_core::{Error, PipelineName, Result};

use crate::job::{JobCounts, JobInfo};
use crate::pipeline::{
    PipelineChangeKind, PipelineInfo, PipelineInfoChange, PipelineState, PipelineStateUpdate,
    PipelineStoppedUpdate,
};
use crate::schema;
use crate::store::{
    ChangeEvent, ChangeFeed, DocumentStore, FeedOptions, OnConflict, Selector, from_document,
    to_document,
};

/// Stores and serves pipeline descriptors on a shared store session.
#[derive(Clone)]
pub struct PipelineRegistry {
    store: Arc<dyn DocumentStore>,
    database: String,
}

impl PipelineRegistry {
    /// Creates a registry over the given session and database.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, database: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
        }
    }

    /// Creates a pipeline descriptor, stamping `created_at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `created_at` is pre-set and
    /// [`Error::Conflict`] for a duplicate name.
    #[tracing::instrument(skip(self, info), fields(pipeline = %info.pipeline_name))]
    pub async fn create_pipeline_info(&self, mut info: PipelineInfo) -> Result<()> {
        if info.created_at.is_some() {
            return Err(Error::invalid_argument("created_at must be unset"));
        }
        info.created_at = Some(Utc::now());
        let doc = to_document(&info)?;
        self.store
            .insert(
                &self.database,
                schema::PIPELINE_INFOS,
                vec![doc],
                OnConflict::Error,
            )
            .await
    }

    /// Upserts a pipeline descriptor, preserving the stored `created_at`.
    ///
    /// The creation timestamp is dropped from the update payload so the
    /// value stamped at first insert survives every later update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `created_at` is set on the
    /// request.
    #[tracing::instrument(skip(self, info), fields(pipeline = %info.pipeline_name))]
    pub async fn update_pipeline_info(&self, info: PipelineInfo) -> Result<()> {
        if info.created_at.is_some() {
            return Err(Error::invalid_argument("created_at must be unset"));
        }
        let mut doc = to_document(&info)?;
        doc.remove("created_at");
        self.store
            .insert(
                &self.database,
                schema::PIPELINE_INFOS,
                vec![doc],
                OnConflict::Merge,
            )
            .await
    }

    /// Upserts a pipeline's lifecycle state.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self, update), fields(pipeline = %update.pipeline_name, state = %update.state))]
    pub async fn update_pipeline_state(&self, update: PipelineStateUpdate) -> Result<()> {
        let doc = to_document(&update)?;
        self.store
            .insert(
                &self.database,
                schema::PIPELINE_INFOS,
                vec![doc],
                OnConflict::Merge,
            )
            .await
    }

    /// Upserts a pipeline's stop flag.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self, update), fields(pipeline = %update.pipeline_name, stopped = update.stopped))]
    pub async fn update_pipeline_stopped(&self, update: PipelineStoppedUpdate) -> Result<()> {
        let doc = to_document(&update)?;
        self.store
            .insert(
                &self.database,
                schema::PIPELINE_INFOS,
                vec![doc],
                OnConflict::Merge,
            )
            .await
    }

    /// Reads a pipeline descriptor and derives its per-state job counts.
    ///
    /// The counts are folded from the jobs index on every call; they are
    /// not cached and not consistent with any particular job write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the pipeline does not exist.
    #[tracing::instrument(skip(self), fields(pipeline = %pipeline_name))]
    pub async fn get_pipeline_info(&self, pipeline_name: &PipelineName) -> Result<PipelineInfo> {
        let doc = self
            .store
            .get(
                &self.database,
                schema::PIPELINE_INFOS,
                pipeline_name.as_str(),
            )
            .await?
            .ok_or_else(|| Error::not_found("pipeline", pipeline_name))?;
        let mut info: PipelineInfo = from_document(doc)?;

        let jobs = self
            .store
            .get_all(
                &self.database,
                schema::JOB_INFOS,
                schema::INDEX_PIPELINE_NAME,
                &json!(pipeline_name.as_str()),
            )
            .await?;
        let mut counts = JobCounts::new();
        for doc in jobs {
            let job: JobInfo = from_document(doc)?;
            *counts.entry(job.state).or_insert(0) += 1;
        }
        info.job_counts = counts;
        Ok(info)
    }

    /// Lists pipelines, optionally restricted to one shard.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self))]
    pub async fn list_pipeline_infos(&self, shard: Option<u64>) -> Result<Vec<PipelineInfo>> {
        let docs = match shard {
            Some(shard) => {
                self.store
                    .get_all(
                        &self.database,
                        schema::PIPELINE_INFOS,
                        schema::INDEX_SHARD,
                        &json!(shard),
                    )
                    .await?
            }
            None => {
                self.store
                    .scan(&self.database, schema::PIPELINE_INFOS)
                    .await?
            }
        };
        docs.into_iter().map(from_document).collect()
    }

    /// Deletes a pipeline descriptor. Succeeds if it is already gone.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self), fields(pipeline = %pipeline_name))]
    pub async fn delete_pipeline_info(&self, pipeline_name: &PipelineName) -> Result<()> {
        self.store
            .delete(
                &self.database,
                schema::PIPELINE_INFOS,
                pipeline_name.as_str(),
            )
            .await
    }

    /// Waits until the pipeline reaches the requested state and returns
    /// the record that satisfied the wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the pipeline does not exist and
    /// [`Error::Canceled`] if the feed closes before the state is seen.
    #[tracing::instrument(skip(self), fields(pipeline = %pipeline_name, state = %state))]
    pub async fn block_pipeline_state(
        &self,
        pipeline_name: &PipelineName,
        state: PipelineState,
    ) -> Result<PipelineInfo> {
        let options = FeedOptions {
            selector: Selector::new()
                .field(schema::PIPELINE_PRIMARY_KEY, pipeline_name.as_str()),
            include_initial: true,
            ..FeedOptions::default()
        };
        let mut feed = self
            .store
            .changefeed(&self.database, schema::PIPELINE_INFOS, options)
            .await?;

        if self
            .store
            .get(
                &self.database,
                schema::PIPELINE_INFOS,
                pipeline_name.as_str(),
            )
            .await?
            .is_none()
        {
            return Err(Error::not_found("pipeline", pipeline_name));
        }

        while let Some(event) = feed.next().await? {
            let Some(doc) = event.new else { continue };
            let info: PipelineInfo = from_document(doc)?;
            if info.state == state {
                return Ok(info);
            }
        }
        Err(Error::canceled("block_pipeline_state"))
    }

    /// Subscribes to pipeline create/update/delete events, optionally
    /// restricted to one shard.
    ///
    /// With `include_initial`, existing pipelines are replayed as `CREATE`
    /// events before live changes. The `state` field is projected out of
    /// the watched records, so pure state transitions are not delivered on
    /// this channel; they flow through
    /// [`PipelineRegistry::block_pipeline_state`].
    ///
    /// # Errors
    ///
    /// Surfaces store errors from opening the feed.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe_pipeline_infos(
        &self,
        shard: Option<u64>,
        include_initial: bool,
    ) -> Result<PipelineInfoFeed> {
        let mut selector = Selector::new();
        if let Some(shard) = shard {
            selector = selector.field("shard", shard);
        }
        let options = FeedOptions {
            selector,
            include_initial,
            without: vec!["state".into()],
        };
        let feed = self
            .store
            .changefeed(&self.database, schema::PIPELINE_INFOS, options)
            .await?;
        Ok(PipelineInfoFeed { feed })
    }

    /// Wipes all jobs, then all pipelines.
    ///
    /// Chunks are deliberately left alone; see DESIGN notes.
    ///
    /// # Errors
    ///
    /// Surfaces store errors.
    #[tracing::instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<()> {
        self.store.wipe(&self.database, schema::JOB_INFOS).await?;
        self.store
            .wipe(&self.database, schema::PIPELINE_INFOS)
            .await
    }
}

/// Stream of [`PipelineInfoChange`] events for one subscriber.
///
/// Ends when the store closes the underlying feed or the subscriber drops
/// it.
#[derive(Debug)]
pub struct PipelineInfoFeed {
    feed: ChangeFeed,
}

impl PipelineInfoFeed {
    /// Waits for the next change.
    ///
    /// Returns `Ok(None)` when the feed has ended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] for a feed event carrying
    /// neither an old nor a new value, and surfaces feed failures.
    pub async fn next(&mut self) -> Result<Option<PipelineInfoChange>> {
        match self.feed.next().await? {
            Some(event) => classify(event).map(Some),
            None => Ok(None),
        }
    }
}

impl Stream for PipelineInfoFeed {
    type Item = Result<PipelineInfoChange>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.feed.poll_next_event(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(item)) => Poll::Ready(Some(item.and_then(classify))),
        }
    }
}

/// Maps a raw feed event onto the subscriber-facing change kinds.
fn classify(event: ChangeEvent) -> Result<PipelineInfoChange> {
    let (doc, kind) = match (event.old, event.new) {
        (Some(_), Some(new)) => (new, PipelineChangeKind::Update),
        (None, Some(new)) => (new, PipelineChangeKind::Create),
        (Some(old), None) => (old, PipelineChangeKind::Delete),
        (None, None) => {
            return Err(Error::protocol_violation(
                "change-feed event carried neither an old nor a new value",
            ));
        }
    };
    Ok(PipelineInfoChange {
        pipeline: from_document(doc)?,
        kind,
    })
}

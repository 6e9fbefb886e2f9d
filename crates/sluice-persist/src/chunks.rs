//! Chunk coordinator: the lock-free work-distribution protocol.
//!
//! Workers coordinate only through chunk state. A claim is an atomic
//! conditional update racing against every other claimer; losers simply
//! move on to the next candidate the change-feed offers. No in-process
//! locks are involved, and no error is ever surfaced for losing a race.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use sluice_core::{ChunkId, Error, JobId, PodName, Result};

use crate::chunk::{Chunk, ChunkState, Pod};
use crate::schema;
use crate::store::{
    Document, DocumentStore, FeedOptions, OnConflict, Selector, from_document, to_document,
};

/// Drives chunks through the claim protocol on a shared store session.
#[derive(Clone)]
pub struct ChunkCoordinator {
    store: Arc<dyn DocumentStore>,
    database: String,
}

impl ChunkCoordinator {
    /// Creates a coordinator over the given session and database.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, database: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
        }
    }

    /// Bulk-inserts chunks. Callers supply the ID, job, and initial
    /// `UNASSIGNED` state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] for a duplicate chunk ID.
    #[tracing::instrument(skip(self, chunks), fields(count = chunks.len()))]
    pub async fn add_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        let docs = chunks
            .iter()
            .map(to_document)
            .collect::<Result<Vec<Document>>>()?;
        self.store
            .insert(&self.database, schema::CHUNKS, docs, OnConflict::Error)
            .await
    }

    /// Claims an unassigned chunk of the job for the pod, blocking until
    /// one is available.
    ///
    /// Watches the job's unassigned chunks with initial replay, so both
    /// already-unassigned and newly-unassigned chunks are candidates. Each
    /// candidate is taken with an atomic conditional update; losing the
    /// race to another claimer just moves on to the next candidate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`] if the feed closes while still waiting,
    /// and surfaces store errors.
    #[tracing::instrument(skip(self), fields(job_id = %job_id, pod = %pod.name))]
    pub async fn claim_chunk(&self, job_id: &JobId, pod: &Pod) -> Result<Chunk> {
        let options = FeedOptions {
            selector: Selector::new()
                .field("job_id", job_id.as_str())
                .field("state", ChunkState::Unassigned.as_str()),
            include_initial: true,
            ..FeedOptions::default()
        };
        let mut feed = self
            .store
            .changefeed(&self.database, schema::CHUNKS, options)
            .await?;

        while let Some(event) = feed.next().await? {
            // Chunks leaving the unassigned set arrive without a new value.
            let Some(candidate) = event.new else { continue };
            let candidate: Chunk = from_document(candidate)?;

            let pod_value = serde_json::to_value(pod)
                .map_err(|err| Error::internal(format!("pod encoding failed: {err}")))?;
            let owner = pod.name.clone();
            let now = Utc::now().timestamp();
            let claimed = self
                .store
                .mutate(
                    &self.database,
                    schema::CHUNKS,
                    candidate.id.as_str(),
                    Box::new(move |doc| {
                        // The chunk may have been taken between the feed
                        // event and this update.
                        if doc.get("state").and_then(Value::as_str)
                            != Some(ChunkState::Unassigned.as_str())
                        {
                            return None;
                        }
                        let mut pods = doc
                            .get("pods")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        pods.push(pod_value);
                        let mut next = doc.clone();
                        next.insert("owner".into(), owner.as_str().into());
                        next.insert("state".into(), ChunkState::Assigned.as_str().into());
                        next.insert("time_touched".into(), now.into());
                        next.insert("pods".into(), Value::Array(pods));
                        Some(next)
                    }),
                )
                .await?;

            if let Some(doc) = claimed {
                return from_document(doc);
            }
        }
        Err(Error::canceled("claim_chunk"))
    }

    /// Marks the chunk successful if the pod still holds it.
    ///
    /// Returns the updated chunk, or `None` when the pod no longer owns it
    /// (for example, the chunk was revoked and re-claimed). Losing the
    /// guard is not an error.
    ///
    /// # Errors
    ///
    /// Surfaces store errors only.
    #[tracing::instrument(skip(self), fields(chunk_id = %chunk_id, pod = %pod_name))]
    pub async fn finish_chunk(
        &self,
        chunk_id: &ChunkId,
        pod_name: &PodName,
    ) -> Result<Option<Chunk>> {
        let owner = pod_name.clone();
        let finished = self
            .store
            .mutate(
                &self.database,
                schema::CHUNKS,
                chunk_id.as_str(),
                Box::new(move |doc| {
                    if !holds_chunk(doc, &owner) {
                        return None;
                    }
                    let mut next = doc.clone();
                    next.insert("state".into(), ChunkState::Success.as_str().into());
                    Some(next)
                }),
            )
            .await?;
        finished.map(from_document).transpose()
    }

    /// Takes the chunk away from the pod, returning it to the pool or
    /// failing it once the retry budget is spent.
    ///
    /// If the pod still holds the chunk, its state becomes `FAILED` when
    /// `max_pods` or more pods have held it, otherwise `UNASSIGNED` so
    /// another pod can claim it. The owner field is left as history; the
    /// claim and finish guards gate on state alone.
    ///
    /// Returns the updated chunk, or `None` when the pod no longer owns
    /// it.
    ///
    /// # Errors
    ///
    /// Surfaces store errors only.
    #[tracing::instrument(skip(self), fields(chunk_id = %chunk_id, pod = %pod_name, max_pods))]
    pub async fn revoke_chunk(
        &self,
        chunk_id: &ChunkId,
        pod_name: &PodName,
        max_pods: usize,
    ) -> Result<Option<Chunk>> {
        let owner = pod_name.clone();
        let revoked = self
            .store
            .mutate(
                &self.database,
                schema::CHUNKS,
                chunk_id.as_str(),
                Box::new(move |doc| {
                    if !holds_chunk(doc, &owner) {
                        return None;
                    }
                    let assignments = doc
                        .get("pods")
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len);
                    let state = if assignments >= max_pods {
                        ChunkState::Failed
                    } else {
                        ChunkState::Unassigned
                    };
                    let mut next = doc.clone();
                    next.insert("state".into(), state.as_str().into());
                    Some(next)
                }),
            )
            .await?;
        revoked.map(from_document).transpose()
    }
}

/// True when the record shows the pod as the active holder: owner matches
/// and the chunk is still assigned.
fn holds_chunk(doc: &Document, pod_name: &PodName) -> bool {
    doc.get("owner").and_then(Value::as_str) == Some(pod_name.as_str())
        && doc.get("state").and_then(Value::as_str) == Some(ChunkState::Assigned.as_str())
}

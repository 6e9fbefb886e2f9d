//! Logical schema: collection names, index names, and first-use
//! initialization.
//!
//! Three collections hold everything the service persists. There is no
//! schema-version record; initialization is idempotent and that is the
//! versioning strategy.

use std::sync::Arc;

use sluice_core::Result;

use crate::store::{CollectionSpec, DocumentStore, IndexSpec};

/// Collection of job descriptors, keyed by job ID.
pub const JOB_INFOS: &str = "job_infos";
/// Collection of pipeline descriptors, keyed by pipeline name.
pub const PIPELINE_INFOS: &str = "pipeline_infos";
/// Collection of chunks, keyed by chunk ID.
pub const CHUNKS: &str = "chunks";

/// Primary key field of [`JOB_INFOS`].
pub const JOB_PRIMARY_KEY: &str = "job_id";
/// Primary key field of [`PIPELINE_INFOS`].
pub const PIPELINE_PRIMARY_KEY: &str = "pipeline_name";
/// Primary key field of [`CHUNKS`].
pub const CHUNK_PRIMARY_KEY: &str = "id";

/// Jobs by owning pipeline.
pub const INDEX_PIPELINE_NAME: &str = "pipeline_name";
/// Jobs by input-commit fingerprint.
pub const INDEX_COMMIT_INDEX: &str = "commit_index";
/// Jobs by `(pipeline, fingerprint)` pair.
pub const INDEX_PIPELINE_NAME_AND_COMMIT_INDEX: &str = "pipeline_name_and_commit_index";
/// Pipelines by shard number.
pub const INDEX_SHARD: &str = "shard";
/// Chunks by owning job.
pub const INDEX_JOB_ID: &str = "job_id";

/// Every collection the service persists.
pub const COLLECTIONS: [CollectionSpec; 3] = [
    CollectionSpec {
        name: JOB_INFOS,
        primary_key: JOB_PRIMARY_KEY,
        indexes: &[
            IndexSpec {
                name: INDEX_PIPELINE_NAME,
                fields: &["pipeline"],
            },
            IndexSpec {
                name: INDEX_COMMIT_INDEX,
                fields: &["commit_index"],
            },
            IndexSpec {
                name: INDEX_PIPELINE_NAME_AND_COMMIT_INDEX,
                fields: &["pipeline", "commit_index"],
            },
        ],
    },
    CollectionSpec {
        name: PIPELINE_INFOS,
        primary_key: PIPELINE_PRIMARY_KEY,
        indexes: &[IndexSpec {
            name: INDEX_SHARD,
            fields: &["shard"],
        }],
    },
    CollectionSpec {
        name: CHUNKS,
        primary_key: CHUNK_PRIMARY_KEY,
        indexes: &[IndexSpec {
            name: INDEX_JOB_ID,
            fields: &["job_id"],
        }],
    },
];

/// Creates and verifies the service's collections on a shared store
/// session.
#[derive(Clone)]
pub struct SchemaManager {
    store: Arc<dyn DocumentStore>,
    database: String,
}

impl SchemaManager {
    /// Creates a manager over the given session and database.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, database: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
        }
    }

    /// Creates the database, collections, and indexes on first use.
    ///
    /// If the database already exists the whole call is a no-op: an earlier
    /// boot already ran it, and the collections are left alone. Safe to run
    /// on every boot.
    ///
    /// # Errors
    ///
    /// Any store error is fatal and surfaced.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub async fn initialize(&self) -> Result<()> {
        if !self
            .store
            .create_database(&self.database)
            .await?
            .is_created()
        {
            tracing::debug!("database already initialized");
            return Ok(());
        }
        for spec in COLLECTIONS {
            self.store.create_collection(&self.database, spec).await?;
        }
        tracing::info!("database initialized");
        Ok(())
    }

    /// Waits for every collection and index to become ready.
    ///
    /// Used as a startup gate by dependent services; fails if anything is
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for a missing collection or index.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub async fn check(&self) -> Result<()> {
        for spec in &COLLECTIONS {
            let indexes: Vec<&str> = spec.indexes.iter().map(|index| index.name).collect();
            self.store
                .wait_ready(&self.database, spec.name, &indexes)
                .await?;
        }
        Ok(())
    }
}

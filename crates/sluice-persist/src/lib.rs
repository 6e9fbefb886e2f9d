//! # sluice-persist
//!
//! Persistence and coordination core for the sluice pipeline orchestrator.
//!
//! This crate manages the three durable entity classes of the orchestrator
//! and the concurrent coordination around them:
//!
//! - **Pipelines**: long-lived compute definitions, routed to shards
//! - **Jobs**: single executions of a pipeline over specific input commits
//! - **Chunks**: work units within a job, claimed and processed by pods
//!
//! The interesting part is not the CRUD but the coordination: atomic state
//! transitions under contention, change-feed subscriptions with
//! initial-state replay, and blocking reads that wait for a watched record
//! to reach a target state. All of it rides on a backing document store
//! reached through the [`store::DocumentStore`] trait; concurrency safety
//! is delegated to the store's conditional single-record updates, so no
//! in-process locks are needed.
//!
//! ## Components
//!
//! - [`schema::SchemaManager`]: creates and verifies collections/indexes
//! - [`jobs::JobRegistry`]: job descriptors, fingerprint derivation,
//!   blocking inspection
//! - [`pipelines::PipelineRegistry`]: pipeline descriptors, subscriptions,
//!   blocking state waits, derived job counts
//! - [`chunks::ChunkCoordinator`]: the claim/finish/revoke work protocol
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sluice_core::JobId;
//! use sluice_persist::job::JobInfo;
//! use sluice_persist::service::PersistService;
//! use sluice_persist::store::memory::InMemoryStore;
//!
//! # async fn demo() -> sluice_core::Result<()> {
//! let service = PersistService::new(Arc::new(InMemoryStore::new()), "sluice");
//! service.schema().initialize().await?;
//!
//! let job = JobInfo::new(JobId::new("job-1"), None, vec![]);
//! let created = service.jobs().create_job_info(job).await?;
//! assert!(created.started.is_some());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod chunk;
pub mod chunks;
pub mod config;
pub mod job;
pub mod jobs;
pub mod pipeline;
pub mod pipelines;
pub mod schema;
pub mod service;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::chunk::{Chunk, ChunkState, Pod};
    pub use crate::chunks::ChunkCoordinator;
    pub use crate::config::StoreConfig;
    pub use crate::job::{Commit, JobInfo, JobInput, JobState, JobStateUpdate};
    pub use crate::jobs::JobRegistry;
    pub use crate::pipeline::{
        PipelineChangeKind, PipelineInfo, PipelineInfoChange, PipelineState,
    };
    pub use crate::pipelines::{PipelineInfoFeed, PipelineRegistry};
    pub use crate::schema::SchemaManager;
    pub use crate::service::PersistService;
    pub use crate::store::{DocumentStore, memory::InMemoryStore};
}

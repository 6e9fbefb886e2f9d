//! # sluice-core
//!
//! Core abstractions shared by the sluice pipeline-orchestration services.
//!
//! This crate provides the foundational types used across all sluice components:
//!
//! - **Identifiers**: Strongly-typed names for jobs, pipelines, chunks, and pods
//! - **Error Types**: The shared error taxonomy and result alias
//! - **Observability**: Structured-logging initialization helpers
//!
//! ## Crate Boundary
//!
//! `sluice-core` is the only crate allowed to define shared primitives.
//! Higher layers (the persistence service, control loops, workers) depend on
//! it and never on each other's internals.
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::prelude::*;
//!
//! let job = JobId::new("job-7f2a");
//! let pipeline = PipelineName::new("wordcount");
//! assert!(!job.is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use sluice_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ChunkId, JobId, PipelineName, PodName};
    pub use crate::observability::{LogFormat, init_logging};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{ChunkId, JobId, PipelineName, PodName};
pub use observability::{LogFormat, init_logging};

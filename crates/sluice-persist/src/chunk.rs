//! Chunk records for the work-distribution protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

use sluice_core::{ChunkId, JobId, PodName};

/// State of a chunk in the claim protocol.
///
/// `UNASSIGNED -> ASSIGNED -> {SUCCESS, FAILED}`, with re-entry
/// `ASSIGNED -> UNASSIGNED` when a pod gives the chunk back.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    /// Available to be claimed.
    #[default]
    Unassigned,
    /// Claimed and being processed by `owner`.
    Assigned,
    /// Processed successfully.
    Success,
    /// Retry budget exhausted; terminally failed.
    Failed,
}

impl ChunkState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "UNASSIGNED",
            Self::Assigned => "ASSIGNED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A worker pod, as recorded in a chunk's assignment history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// The pod's name.
    pub name: PodName,
}

impl Pod {
    /// Creates a pod reference.
    #[must_use]
    pub fn new(name: impl Into<PodName>) -> Self {
        Self { name: name.into() }
    }
}

/// One unit of work within a job.
///
/// `owner` is only authoritative while `state` is `ASSIGNED`: a revoked
/// chunk keeps its last owner for the history in `pods`, and the claim and
/// finish guards gate on `state`, never on `owner` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique chunk identifier.
    pub id: ChunkId,

    /// The job this chunk belongs to.
    pub job_id: JobId,

    /// Position in the claim protocol.
    #[serde(default)]
    pub state: ChunkState,

    /// The pod holding the chunk, or the empty name.
    #[serde(default)]
    pub owner: PodName,

    /// Every pod that has ever been assigned this chunk, in claim order.
    #[serde(default)]
    pub pods: Vec<Pod>,

    /// Unix-second timestamp of the last ownership change.
    #[serde(default)]
    pub time_touched: i64,
}

impl Chunk {
    /// Creates an unassigned chunk for the given job.
    #[must_use]
    pub fn new(id: ChunkId, job_id: JobId) -> Self {
        Self {
            id,
            job_id,
            state: ChunkState::default(),
            owner: PodName::default(),
            pods: Vec::new(),
            time_touched: 0,
        }
    }
}

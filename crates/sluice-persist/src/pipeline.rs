//! Pipeline descriptors and subscription change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use sluice_core::PipelineName;

use crate::job::JobCounts;

/// Lifecycle state of a pipeline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// The control loop is bringing the pipeline up.
    #[default]
    Starting,
    /// The pipeline is processing jobs.
    Running,
    /// The control loop is restarting the pipeline after an error.
    Restarting,
    /// The pipeline has failed and requires intervention.
    Failure,
}

impl PipelineState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Restarting => "RESTARTING",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored pipeline descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    /// Unique name, assigned by the caller.
    pub pipeline_name: PipelineName,

    /// The shard this pipeline is routed to.
    #[serde(default)]
    pub shard: u64,

    /// Current lifecycle state.
    #[serde(default)]
    pub state: PipelineState,

    /// Whether the pipeline has been stopped by an operator.
    #[serde(default)]
    pub stopped: bool,

    /// When the pipeline was first created. Assigned server-side on first
    /// insert and preserved across every later update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Per-state counts of this pipeline's jobs. Derived on read by
    /// [`crate::pipelines::PipelineRegistry::get_pipeline_info`]; never
    /// persisted.
    #[serde(skip)]
    pub job_counts: JobCounts,
}

impl PipelineInfo {
    /// Creates a descriptor ready to hand to the pipeline registry.
    #[must_use]
    pub fn new(pipeline_name: PipelineName, shard: u64) -> Self {
        Self {
            pipeline_name,
            shard,
            ..Self::default()
        }
    }
}

/// State transition payload for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStateUpdate {
    /// The pipeline to update.
    pub pipeline_name: PipelineName,
    /// The new state.
    pub state: PipelineState,
}

/// Stop-flag payload for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStoppedUpdate {
    /// The pipeline to update.
    pub pipeline_name: PipelineName,
    /// The new stop flag.
    pub stopped: bool,
}

/// Kind of change delivered to pipeline subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineChangeKind {
    /// The pipeline came into existence (or was replayed as initial state).
    Create,
    /// An existing pipeline's record changed.
    Update,
    /// The pipeline was deleted.
    Delete,
}

/// One change delivered to a pipeline subscriber.
///
/// For `Delete` the carried record is the last value the pipeline had;
/// otherwise it is the record after the change. State transitions are not
/// delivered on this channel at all; they flow through
/// [`crate::pipelines::PipelineRegistry::block_pipeline_state`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfoChange {
    /// The pipeline record the change refers to.
    pub pipeline: PipelineInfo,
    /// What happened to it.
    pub kind: PipelineChangeKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_state_wire_names_match_serde() {
        for state in [
            PipelineState::Starting,
            PipelineState::Running,
            PipelineState::Restarting,
            PipelineState::Failure,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }

    #[test]
    fn job_counts_are_never_persisted() {
        let mut info = PipelineInfo::new(PipelineName::new("p"), 0);
        info.job_counts.insert(crate::job::JobState::Running, 3);
        let value = serde_json::to_value(&info).unwrap();
        assert!(!value.as_object().unwrap().contains_key("job_counts"));
    }

    #[test]
    fn created_at_is_not_serialized_when_unset() {
        let info = PipelineInfo::new(PipelineName::new("p"), 0);
        let value = serde_json::to_value(&info).unwrap();
        assert!(!value.as_object().unwrap().contains_key("created_at"));
    }
}

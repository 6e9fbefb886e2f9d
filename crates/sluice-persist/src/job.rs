//! Job descriptors and the commit-set fingerprint.
//!
//! A job is one execution of a pipeline over a specific set of input
//! commits. The descriptor is written once by the orchestration layer and
//! then driven through its lifecycle by partial updates; the `commit_index`
//! fingerprint is derived server-side so that jobs over the same input set
//! can be found through a single index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use sluice_core::{Error, JobId, PipelineName, Result};

/// A commit in the upstream content-addressed file system.
///
/// Commits are opaque to this service: the repo name and commit ID are
/// owned by the file-system service and only ever compared or concatenated
/// here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Name of the repo the commit belongs to.
    pub repo: String,
    /// The commit identifier within the repo.
    pub id: String,
}

impl Commit {
    /// Creates a commit reference.
    #[must_use]
    pub fn new(repo: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            id: id.into(),
        }
    }
}

/// One input to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    /// The commit this input reads.
    pub commit: Commit,
}

impl JobInput {
    /// Creates an input reading the given commit.
    #[must_use]
    pub const fn new(commit: Commit) -> Self {
        Self { commit }
    }
}

/// Lifecycle state of a job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Descriptor written, chunks not yet laid out.
    #[default]
    Creating,
    /// Workers are pulling input data.
    Pulling,
    /// Workers are processing chunks.
    Running,
    /// The input set contained no data to process.
    Empty,
    /// All chunks completed successfully.
    Success,
    /// The job failed.
    Failure,
}

impl JobState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Pulling => "PULLING",
            Self::Running => "RUNNING",
            Self::Empty => "EMPTY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    /// Returns true if the state is one a blocking inspect resolves on.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Empty | Self::Success | Self::Failure)
    }

    /// Returns true if the state carries a completion timestamp.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-state job counts for a pipeline, derived on read.
pub type JobCounts = BTreeMap<JobState, u64>;

/// A stored job descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Unique identifier, assigned by the caller.
    pub job_id: JobId,

    /// Owning pipeline, or `None` for one-off jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineName>,

    /// Ordered list of input commits.
    #[serde(default)]
    pub inputs: Vec<JobInput>,

    /// Derived fingerprint over the input commit set.
    ///
    /// Assigned server-side at creation; callers must leave it empty.
    #[serde(default)]
    pub commit_index: String,

    /// Current lifecycle state.
    #[serde(default)]
    pub state: JobState,

    /// When the job was created. Assigned server-side, immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// When the job reached `SUCCESS` or `FAILURE`. Assigned server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    /// Output commit written after completion, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Commit>,
}

impl JobInfo {
    /// Creates a descriptor ready to hand to the job registry.
    #[must_use]
    pub fn new(job_id: JobId, pipeline: Option<PipelineName>, inputs: Vec<JobInput>) -> Self {
        Self {
            job_id,
            pipeline,
            inputs,
            commit_index: String::new(),
            state: JobState::default(),
            started: None,
            finished: None,
            output: None,
        }
    }

    /// The job's input commits, in input order.
    #[must_use]
    pub fn input_commits(&self) -> Vec<Commit> {
        self.inputs.iter().map(|input| input.commit.clone()).collect()
    }
}

/// Partial update applying a state transition to a stored job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateUpdate {
    /// The job to update.
    pub job_id: JobId,
    /// The new state.
    pub state: JobState,
    /// Completion timestamp. Assigned server-side; callers must leave unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl JobStateUpdate {
    /// Creates a state transition for the given job.
    #[must_use]
    pub const fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            finished: None,
        }
    }
}

/// Partial update attaching an output commit to a stored job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutputUpdate {
    /// The job to update.
    pub job_id: JobId,
    /// The output commit.
    pub output: Commit,
}

/// Derives the commit-set fingerprint for a set of input commits.
///
/// Each commit contributes `"{repo}/{id}"`; contributions are sorted
/// byte-wise and concatenated without a separator, so the fingerprint is
/// insensitive to input order. The empty input yields the empty string.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if any commit has an empty ID.
pub fn commit_index(commits: &[Commit]) -> Result<String> {
    let mut keys = Vec::with_capacity(commits.len());
    for commit in commits {
        if commit.id.is_empty() {
            return Err(Error::invalid_argument(format!(
                "cannot index commit \"{}/{}\"",
                commit.repo, commit.id
            )));
        }
        keys.push(format!("{}/{}", commit.repo, commit.id));
    }
    keys.sort_unstable();
    Ok(keys.concat())
}

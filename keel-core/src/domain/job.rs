//! Job domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a job
///
/// Used verbatim as the Docker network name and, prefixed, as the Kubernetes
/// service name, so it should stay friendly to both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of an environment scope on the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(pub String);

/// A job to be processed by the runner
///
/// Jobs are created by the coordinator, or synthesized once when running
/// locally. The state is terminal once it reaches `Failed`, `Success` or
/// `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub environment_id: Option<EnvironmentId>,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub commit: Commit,
    #[serde(default)]
    pub state: JobState,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Waiting,
    Processing,
    Failed,
    Success,
    Cancelled,
}

impl JobState {
    /// Returns true once the job can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Success | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Success => "success",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The commit a job should build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub branch: String,
    #[serde(default)]
    pub revision: String,
}

/// A VCS repository known to the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: String,
}

impl Repository {
    /// The repository descriptor of a job that runs in place, without cloning
    pub fn local() -> Self {
        Self::default()
    }

    pub fn is_local(&self) -> bool {
        *self == Self::local()
    }

    /// Search path used for environment and secret lookups
    pub fn search_path(&self) -> Vec<String> {
        vec![self.project.clone(), self.name.clone()]
    }
}

//! Job DTOs for runner/coordinator communication

use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, JobState};

/// Response to a request for the next available job
///
/// `job` is `None` when nothing is queued, the runner is expected to retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextJobResponse {
    pub job: Option<Job>,
}

/// Final or intermediate state pushed by the runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetJobStateRequest {
    pub state: JobState,
}

/// Response to a cancellation check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationResponse {
    pub cancelled: bool,
}

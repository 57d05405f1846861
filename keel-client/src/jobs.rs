//! Job-related API endpoints

use crate::CoordinatorClient;
use crate::error::Result;
use keel_core::domain::job::{Job, JobId, JobState};
use keel_core::domain::log::LogStream;
use keel_core::domain::stage::{StageId, StageState};
use keel_core::dto::job::{CancellationResponse, NextJobResponse, SetJobStateRequest};
use keel_core::dto::log::JobLogRequest;
use keel_core::dto::stage::SetStageStateRequest;

impl CoordinatorClient {
    // =============================================================================
    // Job Lifecycle
    // =============================================================================

    /// Claim the next available job
    ///
    /// The coordinator guarantees a job is handed to at most one runner.
    ///
    /// # Returns
    /// The claimed job, or `None` if nothing is queued
    pub async fn get_next_available_job(&self) -> Result<Option<Job>> {
        let response = self.post("/api/runner/jobs/next").send().await?;

        let next: NextJobResponse = self.handle_response(response).await?;
        Ok(next.job)
    }

    /// Set the state of a job
    ///
    /// # Arguments
    /// * `job_id` - The job to update
    /// * `state` - The new state
    pub async fn set_job_state(&self, job_id: &JobId, state: JobState) -> Result<()> {
        let response = self
            .put(&format!("/api/runner/jobs/{}/state", job_id))
            .json(&SetJobStateRequest { state })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Check whether a job has been cancelled by a user
    pub async fn has_been_cancelled(&self, job_id: &JobId) -> Result<bool> {
        let response = self
            .get(&format!("/api/runner/jobs/{}/cancelled", job_id))
            .send()
            .await?;

        let reply: CancellationResponse = self.handle_response(response).await?;
        Ok(reply.cancelled)
    }

    // =============================================================================
    // Job Progress
    // =============================================================================

    /// Store a job level log line against a stage
    pub async fn log(
        &self,
        job_id: &JobId,
        message: &str,
        stream: LogStream,
        stage_id: &StageId,
    ) -> Result<()> {
        let response = self
            .post(&format!("/api/runner/jobs/{}/logs", job_id))
            .json(&JobLogRequest {
                message: message.to_string(),
                stream,
                stage_id: stage_id.clone(),
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Set the state of a stage within a job
    pub async fn set_stage_state(
        &self,
        job_id: &JobId,
        stage_id: &StageId,
        state: StageState,
    ) -> Result<()> {
        let response = self
            .put(&format!("/api/runner/jobs/{}/stages/{}/state", job_id, stage_id))
            .json(&SetStageStateRequest { state })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

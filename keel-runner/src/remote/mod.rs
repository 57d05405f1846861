//! Coordinator contract
//!
//! Everything the runner needs from the coordinator, as one trait. The HTTP
//! implementation lives in `http`; tests use in-memory fakes.

mod http;

use anyhow::Result;
use async_trait::async_trait;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState};
use keel_core::domain::job::{Job, JobId, JobState};
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::ContainerSpec;
use keel_core::domain::stage::{StageId, StageState};

/// Communication between a runner and the coordinator
///
/// All calls are synchronous round trips and may fail transiently.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Claims the next job, `None` if there is nothing to do
    ///
    /// The coordinator guarantees a job is handed to a single runner.
    async fn get_next_available_job(&self) -> Result<Option<Job>>;

    async fn set_job_state(&self, id: &JobId, state: JobState) -> Result<()>;

    async fn has_been_cancelled(&self, id: &JobId) -> Result<bool>;

    async fn log(
        &self,
        id: &JobId,
        message: &str,
        stream: LogStream,
        stage_id: &StageId,
    ) -> Result<()>;

    async fn set_stage_state(&self, job_id: &JobId, id: &StageId, state: StageState)
    -> Result<()>;

    /// Registers a container under the id the runtime assigned it
    async fn add_container(
        &self,
        id: &JobId,
        container_id: &ContainerId,
        meta: ContainerMeta,
        container: &ContainerSpec,
        state: ContainerState,
    ) -> Result<()>;

    async fn set_container_state(&self, id: &ContainerId, state: ContainerState) -> Result<()>;

    async fn container_log(&self, id: &ContainerId, message: &str, stream: LogStream)
    -> Result<()>;

    async fn search_for_value(&self, search_path: &[String], name: &str) -> Result<String>;

    async fn search_for_secret(&self, search_path: &[String], name: &str) -> Result<String>;
}

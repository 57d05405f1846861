//! Progress recording
//!
//! The executor reports everything observable about a job through a
//! `Recorder`. Locally that ends up in the tracing output, remotely it is
//! forwarded to the coordinator.

mod local;
mod remote;

pub use local::LocalRecorder;
pub use remote::RemoteRecorder;

use anyhow::Result;
use async_trait::async_trait;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState};
use keel_core::domain::job::JobId;
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::ContainerSpec;
use keel_core::domain::stage::{StageId, StageState};

#[async_trait]
pub trait Recorder: Send + Sync {
    /// Records a message against a stage of the job
    async fn record_log(
        &self,
        job_id: &JobId,
        message: &str,
        stream: LogStream,
        stage_id: &StageId,
    ) -> Result<()>;

    /// Records a newly dispatched container
    async fn record_container(
        &self,
        job_id: &JobId,
        container_id: &ContainerId,
        meta: ContainerMeta,
        container: &ContainerSpec,
        state: ContainerState,
    ) -> Result<()>;

    async fn record_stage_state(
        &self,
        job_id: &JobId,
        stage_id: &StageId,
        state: StageState,
    ) -> Result<()>;

    async fn record_container_state(
        &self,
        container_id: &ContainerId,
        state: ContainerState,
    ) -> Result<()>;

    /// Records one line of container output
    async fn record_container_log(
        &self,
        container_id: &ContainerId,
        log: &str,
        stream: LogStream,
    ) -> Result<()>;
}

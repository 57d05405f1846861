use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState};
use keel_core::domain::job::JobId;
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::ContainerSpec;
use keel_core::domain::stage::{StageId, StageState};

use super::Recorder;
use crate::remote::Remote;

/// Forwards every record to the coordinator
#[derive(Clone)]
pub struct RemoteRecorder {
    remote: Arc<dyn Remote>,
}

impl RemoteRecorder {
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl Recorder for RemoteRecorder {
    async fn record_log(
        &self,
        job_id: &JobId,
        message: &str,
        stream: LogStream,
        stage_id: &StageId,
    ) -> Result<()> {
        self.remote
            .log(job_id, message, stream, stage_id)
            .await
            .context("error recording log")
    }

    async fn record_container(
        &self,
        job_id: &JobId,
        container_id: &ContainerId,
        meta: ContainerMeta,
        container: &ContainerSpec,
        state: ContainerState,
    ) -> Result<()> {
        self.remote
            .add_container(job_id, container_id, meta, container, state)
            .await
            .context("error recording container")
    }

    async fn record_stage_state(
        &self,
        job_id: &JobId,
        stage_id: &StageId,
        state: StageState,
    ) -> Result<()> {
        self.remote
            .set_stage_state(job_id, stage_id, state)
            .await
            .context("error recording stage state")
    }

    async fn record_container_state(
        &self,
        container_id: &ContainerId,
        state: ContainerState,
    ) -> Result<()> {
        self.remote
            .set_container_state(container_id, state)
            .await
            .context("error recording container state")
    }

    async fn record_container_log(
        &self,
        container_id: &ContainerId,
        log: &str,
        stream: LogStream,
    ) -> Result<()> {
        self.remote
            .container_log(container_id, log, stream)
            .await
            .context("error recording container log")
    }
}

use anyhow::Result;
use async_trait::async_trait;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState};
use keel_core::domain::job::JobId;
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::ContainerSpec;
use keel_core::domain::stage::{StageId, StageState};
use tracing::{error, info};

use super::Recorder;

/// Recorder for local runs, everything goes to the tracing output
#[derive(Debug, Default, Clone)]
pub struct LocalRecorder;

impl LocalRecorder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recorder for LocalRecorder {
    async fn record_log(
        &self,
        job_id: &JobId,
        message: &str,
        stream: LogStream,
        stage_id: &StageId,
    ) -> Result<()> {
        match stream {
            LogStream::Stdout => info!(job = %job_id, stage = %stage_id, "{}", message),
            LogStream::Stderr => error!(job = %job_id, stage = %stage_id, "{}", message),
        }
        Ok(())
    }

    async fn record_container(
        &self,
        job_id: &JobId,
        container_id: &ContainerId,
        meta: ContainerMeta,
        container: &ContainerSpec,
        state: ContainerState,
    ) -> Result<()> {
        info!(
            job = %job_id,
            stage = %meta.stage_id,
            service = meta.service,
            "Container {} ({}) is {}",
            container_id,
            container.image,
            state
        );
        Ok(())
    }

    async fn record_stage_state(
        &self,
        job_id: &JobId,
        stage_id: &StageId,
        state: StageState,
    ) -> Result<()> {
        info!(job = %job_id, "Stage {} is {:?}", stage_id, state);
        Ok(())
    }

    async fn record_container_state(
        &self,
        container_id: &ContainerId,
        state: ContainerState,
    ) -> Result<()> {
        info!("Container {} is {}", container_id, state);
        Ok(())
    }

    async fn record_container_log(
        &self,
        container_id: &ContainerId,
        log: &str,
        stream: LogStream,
    ) -> Result<()> {
        match stream {
            LogStream::Stdout => info!(container = %container_id, "{}", log),
            LogStream::Stderr => error!(container = %container_id, "{}", log),
        }
        Ok(())
    }
}

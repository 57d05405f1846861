//! `Remote` over the coordinator's HTTP API

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_client::CoordinatorClient;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState};
use keel_core::domain::job::{Job, JobId, JobState};
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::ContainerSpec;
use keel_core::domain::stage::{StageId, StageState};

use super::Remote;

#[async_trait]
impl Remote for CoordinatorClient {
    async fn get_next_available_job(&self) -> Result<Option<Job>> {
        CoordinatorClient::get_next_available_job(self)
            .await
            .context("Failed to fetch next available job")
    }

    async fn set_job_state(&self, id: &JobId, state: JobState) -> Result<()> {
        CoordinatorClient::set_job_state(self, id, state)
            .await
            .with_context(|| format!("Failed to set state of job {}", id))
    }

    async fn has_been_cancelled(&self, id: &JobId) -> Result<bool> {
        match CoordinatorClient::has_been_cancelled(self, id).await {
            Ok(cancelled) => Ok(cancelled),
            // A job the coordinator no longer knows about cannot keep running
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e).with_context(|| format!("Failed to check cancellation of job {}", id)),
        }
    }

    async fn log(
        &self,
        id: &JobId,
        message: &str,
        stream: LogStream,
        stage_id: &StageId,
    ) -> Result<()> {
        CoordinatorClient::log(self, id, message, stream, stage_id)
            .await
            .context("Failed to send job log")
    }

    async fn set_stage_state(
        &self,
        job_id: &JobId,
        id: &StageId,
        state: StageState,
    ) -> Result<()> {
        CoordinatorClient::set_stage_state(self, job_id, id, state)
            .await
            .context("Failed to set stage state")
    }

    async fn add_container(
        &self,
        id: &JobId,
        container_id: &ContainerId,
        meta: ContainerMeta,
        container: &ContainerSpec,
        state: ContainerState,
    ) -> Result<()> {
        CoordinatorClient::add_container(self, id, container_id, meta, container.clone(), state)
            .await
            .context("Failed to add container")
    }

    async fn set_container_state(&self, id: &ContainerId, state: ContainerState) -> Result<()> {
        CoordinatorClient::set_container_state(self, id, state)
            .await
            .context("Failed to set container state")
    }

    async fn container_log(
        &self,
        id: &ContainerId,
        message: &str,
        stream: LogStream,
    ) -> Result<()> {
        CoordinatorClient::container_log(self, id, message, stream)
            .await
            .context("Failed to send container log")
    }

    async fn search_for_value(&self, search_path: &[String], name: &str) -> Result<String> {
        CoordinatorClient::search_for_value(self, search_path, name)
            .await
            .with_context(|| format!("Failed to look up value {}", name))
    }

    async fn search_for_secret(&self, search_path: &[String], name: &str) -> Result<String> {
        CoordinatorClient::search_for_secret(self, search_path, name)
            .await
            .with_context(|| format!("Failed to look up secret {}", name))
    }
}

//! Container-related API endpoints

use crate::CoordinatorClient;
use crate::error::Result;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState};
use keel_core::domain::job::JobId;
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::ContainerSpec;
use keel_core::dto::container::{AddContainerRequest, SetContainerStateRequest};
use keel_core::dto::log::ContainerLogRequest;

impl CoordinatorClient {
    /// Register a dispatched container against a job
    ///
    /// # Arguments
    /// * `job_id` - The job the container belongs to
    /// * `container_id` - The id assigned by the container runtime
    /// * `meta` - Stage and service information
    /// * `container` - The container spec it was created from
    /// * `state` - Its initial state
    pub async fn add_container(
        &self,
        job_id: &JobId,
        container_id: &ContainerId,
        meta: ContainerMeta,
        container: ContainerSpec,
        state: ContainerState,
    ) -> Result<()> {
        let response = self
            .post(&format!("/api/runner/jobs/{}/containers", job_id))
            .json(&AddContainerRequest {
                container_id: container_id.clone(),
                meta,
                container,
                state,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Set the state of a container
    pub async fn set_container_state(
        &self,
        container_id: &ContainerId,
        state: ContainerState,
    ) -> Result<()> {
        let response = self
            .put(&format!("/api/runner/containers/{}/state", container_id))
            .json(&SetContainerStateRequest { state })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Store a line of container output
    pub async fn container_log(
        &self,
        container_id: &ContainerId,
        message: &str,
        stream: LogStream,
    ) -> Result<()> {
        let response = self
            .post(&format!("/api/runner/containers/{}/logs", container_id))
            .json(&ContainerLogRequest {
                message: message.to_string(),
                stream,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

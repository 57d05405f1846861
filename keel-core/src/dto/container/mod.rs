//! Container DTOs for runner/coordinator communication

use serde::{Deserialize, Serialize};

use crate::domain::container::{ContainerId, ContainerMeta, ContainerState};
use crate::domain::pipeline::ContainerSpec;

/// Registers a freshly dispatched container against a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddContainerRequest {
    pub container_id: ContainerId,
    pub meta: ContainerMeta,
    pub container: ContainerSpec,
    pub state: ContainerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetContainerStateRequest {
    pub state: ContainerState,
}

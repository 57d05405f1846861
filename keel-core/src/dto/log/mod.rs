//! Log DTOs for runner/coordinator communication

use serde::{Deserialize, Serialize};

use crate::domain::log::LogStream;
use crate::domain::stage::StageId;

/// A job level log line, attributed to a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogRequest {
    pub message: String,
    pub stream: LogStream,
    pub stage_id: StageId,
}

/// A single line of container output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLogRequest {
    pub message: String,
    pub stream: LogStream,
}

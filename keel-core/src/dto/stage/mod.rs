//! Stage DTOs for runner/coordinator communication

use serde::{Deserialize, Serialize};

use crate::domain::stage::StageState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStageStateRequest {
    pub state: StageState,
}

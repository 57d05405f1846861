//! Container domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

use crate::domain::stage::StageId;

/// Backend-assigned handle of a dispatched container
///
/// The empty id is reserved: it means no backend resource was created and
/// must never be handed to cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub const EMPTY: ContainerId = ContainerId(String::new());

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a container as reported to the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Set of acceptable outcomes when waiting on a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitCondition(u8);

impl WaitCondition {
    pub const RUNNING: WaitCondition = WaitCondition(1 << 0);
    pub const STOPPED: WaitCondition = WaitCondition(1 << 1);

    pub const fn union(self, other: WaitCondition) -> WaitCondition {
        WaitCondition(self.0 | other.0)
    }

    pub fn contains(self, other: WaitCondition) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when running is the only acceptable outcome
    pub fn is_running_only(self) -> bool {
        self == Self::RUNNING
    }
}

impl BitOr for WaitCondition {
    type Output = WaitCondition;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// Extra information recorded alongside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub stage_id: StageId,
    pub service: bool,
}

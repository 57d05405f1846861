//! Job execution
//!
//! `JobHandler` takes a triggered job from workspace preparation to a final
//! state; `Pipeline` runs the stages of a parsed spec on a container runtime.

mod executor;
mod handler;
mod workspace;

pub use executor::Pipeline;
pub use handler::JobHandler;
pub use workspace::{LocalWorkspace, Workspace};

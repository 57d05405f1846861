//! Container runtimes
//!
//! A `ContainerRuntime` runs the containers of one job on some backend. The
//! backend is picked once from configuration and a fresh runtime is built for
//! every job through a `RuntimeFactory`.

mod docker;
mod kubernetes;
mod units;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use keel_core::domain::container::{ContainerId, WaitCondition};
use keel_core::domain::job::JobId;
use keel_core::domain::pipeline::ContainerSpec;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::output::OutputSink;

pub use docker::DockerRuntimeFactory;
pub use kubernetes::KubeRuntimeFactory;

/// How often container state is polled
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Backend selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Kubernetes,
}

/// Failure to dispatch a container
///
/// When the backend had already created something before failing, its id is
/// carried so the caller can still clean it up.
#[derive(Debug, Error)]
#[error("error dispatching container")]
pub struct DispatchError {
    pub container_id: ContainerId,
    #[source]
    pub source: anyhow::Error,
}

impl DispatchError {
    /// Nothing was created on the backend
    pub fn before_create(source: anyhow::Error) -> Self {
        Self {
            container_id: ContainerId::EMPTY,
            source,
        }
    }

    /// The backend created `container_id` and then failed
    pub fn after_create(container_id: ContainerId, source: anyhow::Error) -> Self {
        Self {
            container_id,
            source,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Allocates the job-scoped network or service. Paired with `terminate`.
    async fn initialize(&self, job_id: &JobId, work_dir: &Path) -> Result<()>;

    /// Creates and starts a container, returning once the backend accepted it
    async fn dispatch_container(
        &self,
        job_id: &JobId,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<ContainerId, DispatchError>;

    /// Blocks until the container reaches one of the states in `condition`
    async fn wait_for_container(
        &self,
        id: &ContainerId,
        condition: WaitCondition,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Streams the container's output until it is done producing any
    async fn copy_logs_for_container(
        &self,
        id: &ContainerId,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Force removes a container, also when it was only partially created
    async fn terminate_container(&self, id: &ContainerId) -> Result<()>;

    /// Releases what `initialize` allocated
    async fn terminate(&self, job_id: &JobId) -> Result<()>;
}

/// Builds a runtime per job
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn ContainerRuntime>>;
}

// =============================================================================
// Wait policy
// =============================================================================

/// Container state as seen by a backend at one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// Not started yet
    Pending,
    Running,
    Exited { exit_code: i64 },
    /// The backend reports the container can not make progress
    Failed(String),
}

/// Decides whether a wait is over
///
/// Returns `Ok(true)` when `condition` is satisfied, `Ok(false)` to keep
/// polling, and an error when it can never be satisfied.
pub fn evaluate_wait(observed: &Observed, condition: WaitCondition) -> Result<bool> {
    match observed {
        Observed::Failed(reason) => bail!("container failed: {}", reason),
        Observed::Exited { exit_code } => {
            if *exit_code != 0 && condition.contains(WaitCondition::STOPPED) {
                bail!("container has exited with non zero exit status {}", exit_code);
            }
            if condition.is_running_only() {
                bail!("container has exited whilst waiting for it to be running");
            }
            Ok(true)
        }
        Observed::Running => Ok(condition.contains(WaitCondition::RUNNING)),
        Observed::Pending => Ok(false),
    }
}

/// Polls `observe` every `POLL_INTERVAL` until the wait policy is satisfied
pub(crate) async fn poll_until<F, Fut>(
    id: &ContainerId,
    condition: WaitCondition,
    cancel: &CancellationToken,
    mut observe: F,
) -> Result<()>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Observed>> + Send,
{
    loop {
        if cancel.is_cancelled() {
            bail!("cancelled whilst waiting for container {}", id);
        }

        let observed = observe().await?;
        if evaluate_wait(&observed, condition)? {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled whilst waiting for container {}", id),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

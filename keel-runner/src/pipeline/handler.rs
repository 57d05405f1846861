use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keel_core::domain::job::{Job, JobState};
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::DEFAULT_WAIT_TIMEOUT_SECS;
use keel_core::domain::stage::StageId;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Pipeline, Workspace};
use crate::errors::ErrorChain;
use crate::recorder::Recorder;
use crate::runtime::RuntimeFactory;
use crate::trigger::Event;

/// Stage name job level failures are recorded against
pub const END_STAGE: &str = "end";

/// Processes triggered jobs and reports their final state
pub struct JobHandler {
    runtime_factory: Arc<dyn RuntimeFactory>,
    recorder: Arc<dyn Recorder>,
    workspace: Arc<dyn Workspace>,
    wait_timeout: Duration,
}

impl JobHandler {
    pub fn new(
        runtime_factory: Arc<dyn RuntimeFactory>,
        recorder: Arc<dyn Recorder>,
        workspace: Arc<dyn Workspace>,
    ) -> Self {
        Self {
            runtime_factory,
            recorder,
            workspace,
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        }
    }

    /// Default timeout for service wait clauses
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Runs the event's job and sends its final state back exactly once
    pub async fn handle(&self, event: Event) {
        let Event {
            mut job,
            work_dir,
            state,
            cancel,
        } = event;

        info!("Running job {} in directory {}", job.id, work_dir.display());

        let processed = self.process(&job, &work_dir, &cancel).await;
        job.state = match &processed {
            Ok(()) => JobState::Success,
            Err(_) if cancel.is_cancelled() => JobState::Cancelled,
            Err(_) => JobState::Failed,
        };

        // Clean up failures are reported but never change the state
        let cleaned = self.workspace.clean_up(&job, &work_dir).await;
        let failure = match processed {
            Ok(()) => cleaned.err(),
            Err(e) => Some(ErrorChain::append(e, cleaned)),
        };
        if let Some(e) = failure {
            self.report(&job, e).await;
        }

        info!("Job {} finished: {}", job.id, job.state);
        if state.send(job.state).is_err() {
            warn!("Nobody is waiting for the state of job {}", job.id);
        }
    }

    async fn process(
        &self,
        job: &Job,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let runtime = self
            .runtime_factory
            .create()
            .await
            .context("error creating pipeline runtime")?;

        let spec = self
            .workspace
            .prepare(job, work_dir)
            .await
            .context("failed to prepare workspace")?;

        Pipeline::new(runtime, self.recorder.clone())
            .with_wait_timeout(self.wait_timeout)
            .execute(&spec, work_dir, &job.id, cancel)
            .await
            .context("failed to execute pipeline")
    }

    /// Records a job level failure against the end stage
    async fn report(&self, job: &Job, e: anyhow::Error) {
        let message = format!("{:#}", e);
        error!("Job {} failed: {}", job.id, message);

        if let Err(e) = self
            .recorder
            .record_log(&job.id, &message, LogStream::Stderr, &StageId::new(END_STAGE))
            .await
        {
            error!("{:#}", e);
        }
    }
}

//! Stage execution
//!
//! Stages run strictly in order. Within a stage, services are started first
//! and kept running in the background, then steps run one after another to
//! completion. Every container dispatched for a stage is tracked until it has
//! been terminated, so a failing stage still releases everything it started.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState, WaitCondition};
use keel_core::domain::job::JobId;
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::{ContainerSpec, DEFAULT_WAIT_TIMEOUT_SECS, Spec, Stage};
use keel_core::domain::stage::{StageId, StageState};
use regex::Regex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ErrorChain;
use crate::output::{LineHandler, LineWriter, OutputSink};
use crate::recorder::Recorder;
use crate::runtime::{ContainerRuntime, DispatchError};

/// Runs a spec's stages on one runtime, reporting progress to a recorder
pub struct Pipeline {
    runtime: Arc<dyn ContainerRuntime>,
    recorder: Arc<dyn Recorder>,
    wait_timeout: Duration,
}

/// Containers of the current stage that still need terminating
type Tracked = Vec<ContainerId>;

impl Pipeline {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, recorder: Arc<dyn Recorder>) -> Self {
        Self {
            runtime,
            recorder,
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        }
    }

    /// Timeout for service wait clauses that do not set their own
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Executes every stage of `spec`, stopping at the first failed stage
    ///
    /// # Arguments
    /// * `spec` - Parsed pipeline
    /// * `work_dir` - Job working directory, mounted into containers
    /// * `job_id` - Job being executed
    /// * `cancel` - Job cancellation token
    pub async fn execute(
        &self,
        spec: &Spec,
        work_dir: &Path,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for stage in &spec.stages {
            let stage_id = &stage.id;
            info!("Running stage {} of job {}", stage_id, job_id);

            let mut errors = ErrorChain::new();

            if let Err(e) = self.runtime.initialize(job_id, work_dir).await {
                errors.push(e.context("error initializing stage container runtime"));
            }

            warn_unrecorded(
                self.recorder
                    .record_stage_state(job_id, stage_id, StageState::Running)
                    .await,
                "stage state",
            );

            if errors.is_empty() {
                let mut tracked = Tracked::new();
                let logs_cancel = cancel.child_token();
                let mut log_tasks = Vec::new();

                if let Err(e) = self
                    .execute_stage(job_id, stage, &mut tracked, &mut log_tasks, &logs_cancel, cancel)
                    .await
                {
                    errors.push(e.context(format!("error running {} stage", stage_id)));
                }

                if let Err(e) = self.clean_up(&tracked).await {
                    errors.push(e.context("error cleaning up containers from stage"));
                }

                logs_cancel.cancel();
                for task in log_tasks {
                    task.abort();
                }
            }

            if let Err(e) = self.runtime.terminate(job_id).await {
                errors.push(e.context("error terminating container runtime"));
            }

            let state = if errors.is_empty() {
                StageState::Success
            } else {
                StageState::Error
            };
            warn_unrecorded(
                self.recorder.record_stage_state(job_id, stage_id, state).await,
                "stage state",
            );

            if let Err(error) = errors.into_result() {
                warn_unrecorded(
                    self.recorder
                        .record_log(job_id, &format!("{:#}", error), LogStream::Stderr, stage_id)
                        .await,
                    "stage failure",
                );
                return Err(error);
            }

            info!("Stage {} of job {} succeeded", stage_id, job_id);
        }

        Ok(())
    }

    /// Terminates every tracked container, carrying on past failures
    async fn clean_up(&self, tracked: &[ContainerId]) -> Result<()> {
        let mut errors = ErrorChain::new();

        for id in tracked {
            debug!("Cleaning up container {}", id);

            if let Err(e) = self.runtime.terminate_container(id).await {
                errors.push(e.context("error terminating container"));
            }
            warn_unrecorded(
                self.recorder
                    .record_container_state(id, ContainerState::Stopped)
                    .await,
                "terminated container state",
            );
        }

        errors.into_result()
    }

    async fn execute_stage(
        &self,
        job_id: &JobId,
        stage: &Stage,
        tracked: &mut Tracked,
        log_tasks: &mut Vec<JoinHandle<()>>,
        logs_cancel: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for service in &stage.services {
            let task = self
                .start_service(job_id, &stage.id, service, tracked, logs_cancel, cancel)
                .await?;
            log_tasks.push(task);
        }

        for step in &stage.steps {
            self.run_step(job_id, &stage.id, step, tracked, cancel).await?;
        }

        Ok(())
    }

    /// Dispatches a container, tracking it if the backend created anything
    async fn dispatch(
        &self,
        job_id: &JobId,
        spec: &ContainerSpec,
        tracked: &mut Tracked,
        cancel: &CancellationToken,
    ) -> Result<ContainerId> {
        match self.runtime.dispatch_container(job_id, spec, cancel).await {
            Ok(id) => {
                tracked.push(id.clone());
                Ok(id)
            }
            Err(DispatchError {
                container_id,
                source,
            }) => {
                if !container_id.is_empty() {
                    tracked.push(container_id);
                }
                Err(source)
            }
        }
    }

    /// Starts a service and returns the task streaming its logs
    ///
    /// When the service has a wait clause this only returns once its output
    /// matched, or fails when the timeout elapses first.
    async fn start_service(
        &self,
        job_id: &JobId,
        stage_id: &StageId,
        service: &ContainerSpec,
        tracked: &mut Tracked,
        logs_cancel: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let id = self
            .dispatch(job_id, service, tracked, cancel)
            .await
            .context("error dispatching sidecar service container")?;

        let meta = ContainerMeta {
            stage_id: stage_id.clone(),
            service: true,
        };
        warn_unrecorded(
            self.recorder
                .record_container(job_id, &id, meta, service, ContainerState::Starting)
                .await,
            "sidecar service container creation",
        );

        self.runtime
            .wait_for_container(&id, WaitCondition::RUNNING, cancel)
            .await
            .context("error waiting for sidecar service container to be running")?;

        warn_unrecorded(
            self.recorder
                .record_container_state(&id, ContainerState::Running)
                .await,
            "sidecar service container state",
        );

        let Some(wait) = &service.wait else {
            return Ok(self.spawn_logs(id, None, logs_cancel));
        };

        info!(
            "Waiting for sidecar service container output to match regex: {}",
            wait.output
        );
        let regex = Regex::new(&wait.output)
            .with_context(|| format!("invalid wait regex {}", wait.output))?;

        let (signal, ready) = ReadySignal::new();
        let logs = self.spawn_logs(
            id,
            Some(Matcher {
                regex,
                signal: signal.clone(),
            }),
            logs_cancel,
        );

        let timeout = wait
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.wait_timeout);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            signal.fire(Readiness::TimedOut);
        });

        let outcome = tokio::select! {
            outcome = ready => outcome,
            _ = cancel.cancelled() => {
                timer.abort();
                return Err(abort_with(
                    anyhow!("cancelled whilst waiting for sidecar service container output"),
                    &logs,
                ));
            }
        };
        timer.abort();

        match outcome {
            Ok(Readiness::Matched) => Ok(logs),
            Ok(Readiness::TimedOut) | Err(_) => Err(abort_with(
                anyhow!(
                    "error waiting for sidecar service container output to match regex {}",
                    wait.output
                ),
                &logs,
            )),
        }
    }

    fn spawn_logs(
        &self,
        id: ContainerId,
        matcher: Option<Matcher>,
        cancel: &CancellationToken,
    ) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let recorder = self.recorder.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stdout = LineWriter::new(ContainerLines {
                recorder: recorder.clone(),
                id: id.clone(),
                stream: LogStream::Stdout,
                matcher: matcher.clone(),
            });
            let mut stderr = LineWriter::new(ContainerLines {
                recorder,
                id: id.clone(),
                stream: LogStream::Stderr,
                matcher,
            });

            if let Err(e) = runtime
                .copy_logs_for_container(&id, &mut stdout, &mut stderr, &cancel)
                .await
            {
                debug!("Stopped copying logs of service {}: {:#}", id, e);
            }
            for closed in [stdout.close().await, stderr.close().await] {
                if let Err(e) = closed {
                    debug!("Failed to flush logs of service {}: {:#}", id, e);
                }
            }
        })
    }

    /// Runs a step container to completion
    async fn run_step(
        &self,
        job_id: &JobId,
        stage_id: &StageId,
        step: &ContainerSpec,
        tracked: &mut Tracked,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = self
            .dispatch(job_id, step, tracked, cancel)
            .await
            .context("error dispatching step container")?;

        let meta = ContainerMeta {
            stage_id: stage_id.clone(),
            service: false,
        };
        warn_unrecorded(
            self.recorder
                .record_container(job_id, &id, meta, step, ContainerState::Starting)
                .await,
            "step container creation",
        );

        let mut errors = ErrorChain::new();

        // Stopped is fine too, short commands can finish before the first poll
        if let Err(e) = self
            .runtime
            .wait_for_container(&id, WaitCondition::RUNNING | WaitCondition::STOPPED, cancel)
            .await
        {
            errors.push(e.context("error waiting for container to be ready"));
        }

        let mut stdout = LineWriter::new(ContainerLines {
            recorder: self.recorder.clone(),
            id: id.clone(),
            stream: LogStream::Stdout,
            matcher: None,
        });
        let mut stderr = LineWriter::new(ContainerLines {
            recorder: self.recorder.clone(),
            id: id.clone(),
            stream: LogStream::Stderr,
            matcher: None,
        });

        // Blocks until the container has run to completion
        let copied = self
            .runtime
            .copy_logs_for_container(&id, &mut stdout, &mut stderr, cancel)
            .await;
        if let Err(e) = copied {
            errors.push(e.context("error copying container logs"));
        }
        errors.push_result(stdout.close().await);
        errors.push_result(stderr.close().await);

        if let Err(e) = self.runtime.terminate_container(&id).await {
            errors.push(e.context("error terminating step container"));
        }
        tracked.retain(|tracked| tracked != &id);

        let state = if errors.is_empty() {
            ContainerState::Stopped
        } else {
            ContainerState::Error
        };
        warn_unrecorded(
            self.recorder.record_container_state(&id, state).await,
            "step container state",
        );

        errors.into_result().context("error executing container")
    }
}

/// Recorder failures are reported and never fail the stage
fn warn_unrecorded(result: Result<()>, what: &str) {
    if let Err(e) = result {
        warn!("error recording {}: {:#}", what, e);
    }
}

fn abort_with(error: anyhow::Error, logs: &JoinHandle<()>) -> anyhow::Error {
    logs.abort();
    error
}

// =============================================================================
// Service readiness
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Matched,
    TimedOut,
}

/// Single-use completion signal shared by the log matcher and the timer
///
/// Whoever fires first delivers its outcome. Later fires find the sender
/// already taken and are dropped.
#[derive(Clone)]
struct ReadySignal(Arc<Mutex<Option<oneshot::Sender<Readiness>>>>);

impl ReadySignal {
    fn new() -> (Self, oneshot::Receiver<Readiness>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// Returns true when this call delivered the outcome
    fn fire(&self, readiness: Readiness) -> bool {
        let sender = match self.0.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        sender.is_some_and(|tx| tx.send(readiness).is_ok())
    }
}

#[derive(Clone)]
struct Matcher {
    regex: Regex,
    signal: ReadySignal,
}

/// Forwards container output lines to the recorder
struct ContainerLines {
    recorder: Arc<dyn Recorder>,
    id: ContainerId,
    stream: LogStream,
    matcher: Option<Matcher>,
}

#[async_trait]
impl LineHandler for ContainerLines {
    async fn line(&mut self, line: &str) -> Result<()> {
        if let Some(matcher) = &self.matcher {
            if matcher.regex.is_match(line) && matcher.signal.fire(Readiness::Matched) {
                debug!("Service {} output matched {}", self.id, matcher.regex);
            }
        }

        if let Err(e) = self
            .recorder
            .record_container_log(&self.id, line, self.stream)
            .await
        {
            warn!("Failed to record log line of container {}: {:#}", self.id, e);
        }
        Ok(())
    }
}

//! In-memory collaborators for tests

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use keel_core::domain::container::{ContainerId, ContainerMeta, ContainerState, WaitCondition};
use keel_core::domain::job::{Job, JobId, JobState};
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::{ContainerSpec, Spec};
use keel_core::domain::stage::{StageId, StageState};
use tokio_util::sync::CancellationToken;

use crate::output::OutputSink;
use crate::pipeline::Workspace;
use crate::recorder::Recorder;
use crate::remote::Remote;
use crate::runtime::{ContainerRuntime, DispatchError, RuntimeFactory};

// =============================================================================
// Runtime
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub enum Dispatch {
    #[default]
    Ok,
    FailBeforeCreate,
    FailAfterCreate,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum Wait {
    #[default]
    Ok,
    Fail,
    UntilCancelled,
}

/// How the fake runtime treats containers of one image
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub dispatch: Dispatch,
    pub wait: Wait,
    /// Output written by `copy_logs_for_container`, each after its delay
    pub logs: Vec<(Duration, LogStream, &'static str)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initialize,
    Dispatch(String),
    TerminateContainer(ContainerId),
    Terminate,
}

#[derive(Default)]
pub struct FakeRuntime {
    scripts: HashMap<String, Script>,
    images: Mutex<HashMap<ContainerId, String>>,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicUsize,
    terminate_fails: bool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, image: &str, script: Script) -> Self {
        self.scripts.insert(image.to_string(), script);
        self
    }

    /// Makes `terminate` fail after recording the call
    pub fn failing_terminate(mut self) -> Self {
        self.terminate_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Ids handed to `terminate_container`, in call order
    pub fn terminated(&self) -> Vec<ContainerId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::TerminateContainer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn script_for(&self, id: &ContainerId) -> Script {
        let images = self.images.lock().unwrap();
        images
            .get(id)
            .and_then(|image| self.scripts.get(image))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn initialize(&self, _job_id: &JobId, _work_dir: &Path) -> Result<()> {
        self.record(Call::Initialize);
        Ok(())
    }

    async fn dispatch_container(
        &self,
        _job_id: &JobId,
        spec: &ContainerSpec,
        _cancel: &CancellationToken,
    ) -> Result<ContainerId, DispatchError> {
        self.record(Call::Dispatch(spec.image.clone()));
        let script = self.scripts.get(&spec.image).cloned().unwrap_or_default();

        if let Dispatch::FailBeforeCreate = script.dispatch {
            return Err(DispatchError::before_create(anyhow!("image not found")));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = ContainerId::new(format!("c{}", n));
        self.images.lock().unwrap().insert(id.clone(), spec.image.clone());

        match script.dispatch {
            Dispatch::FailAfterCreate => Err(DispatchError::after_create(id, anyhow!("start failed"))),
            _ => Ok(id),
        }
    }

    async fn wait_for_container(
        &self,
        id: &ContainerId,
        _condition: WaitCondition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.script_for(id).wait {
            Wait::Ok => Ok(()),
            Wait::Fail => bail!("container has exited with non zero exit status 1"),
            Wait::UntilCancelled => {
                cancel.cancelled().await;
                bail!("context cancelled waiting for container")
            }
        }
    }

    async fn copy_logs_for_container(
        &self,
        id: &ContainerId,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for (delay, stream, text) in self.script_for(id).logs {
            tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled whilst copying logs"),
                _ = tokio::time::sleep(delay) => {}
            }
            match stream {
                LogStream::Stdout => stdout.write(text.as_bytes()).await?,
                LogStream::Stderr => stderr.write(text.as_bytes()).await?,
            }
        }
        Ok(())
    }

    async fn terminate_container(&self, id: &ContainerId) -> Result<()> {
        self.record(Call::TerminateContainer(id.clone()));
        Ok(())
    }

    async fn terminate(&self, _job_id: &JobId) -> Result<()> {
        self.record(Call::Terminate);
        if self.terminate_fails {
            bail!("network has active endpoints");
        }
        Ok(())
    }
}

pub struct FakeRuntimeFactory(pub Arc<FakeRuntime>);

#[async_trait]
impl RuntimeFactory for FakeRuntimeFactory {
    async fn create(&self) -> Result<Arc<dyn ContainerRuntime>> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Recorder
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Log {
        stage: String,
        message: String,
        stream: LogStream,
    },
    Container {
        id: ContainerId,
        service: bool,
    },
    StageState {
        stage: String,
        state: StageState,
    },
    ContainerState {
        id: ContainerId,
        state: ContainerState,
    },
    ContainerLog {
        id: ContainerId,
        line: String,
    },
}

#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<Record>>,
    unavailable: bool,
}

impl MemoryRecorder {
    /// Recorder whose every call fails, as when the coordinator is down
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn stage_states(&self) -> Vec<(String, StageState)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::StageState { stage, state } => Some((stage, state)),
                _ => None,
            })
            .collect()
    }

    /// Messages recorded against the job
    pub fn job_logs(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Log { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn logs_for_stage(&self, stage: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Log {
                    stage: s, message, ..
                } if s == stage => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn container_states(&self, id: &ContainerId) -> Vec<ContainerState> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::ContainerState { id: i, state } if &i == id => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn container_logs(&self, id: &ContainerId) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::ContainerLog { id: i, line } if &i == id => Some(line),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: Record) -> Result<()> {
        if self.unavailable {
            bail!("coordinator returned 503");
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn record_log(
        &self,
        _job_id: &JobId,
        message: &str,
        stream: LogStream,
        stage_id: &StageId,
    ) -> Result<()> {
        self.push(Record::Log {
            stage: stage_id.to_string(),
            message: message.to_string(),
            stream,
        })
    }

    async fn record_container(
        &self,
        _job_id: &JobId,
        container_id: &ContainerId,
        meta: ContainerMeta,
        _container: &ContainerSpec,
        _state: ContainerState,
    ) -> Result<()> {
        self.push(Record::Container {
            id: container_id.clone(),
            service: meta.service,
        })
    }

    async fn record_stage_state(
        &self,
        _job_id: &JobId,
        stage_id: &StageId,
        state: StageState,
    ) -> Result<()> {
        self.push(Record::StageState {
            stage: stage_id.to_string(),
            state,
        })
    }

    async fn record_container_state(
        &self,
        container_id: &ContainerId,
        state: ContainerState,
    ) -> Result<()> {
        self.push(Record::ContainerState {
            id: container_id.clone(),
            state,
        })
    }

    async fn record_container_log(
        &self,
        container_id: &ContainerId,
        log: &str,
        _stream: LogStream,
    ) -> Result<()> {
        self.push(Record::ContainerLog {
            id: container_id.clone(),
            line: log.to_string(),
        })
    }
}

// =============================================================================
// Remote
// =============================================================================

/// Coordinator handing out queued jobs
///
/// Polling fails once the queue is empty when `fail_when_empty` is set, which
/// is how tests stop the poll loop.
#[derive(Default)]
pub struct FakeRemote {
    pub jobs: Mutex<VecDeque<Job>>,
    pub fail_when_empty: bool,
    /// Cancellation checks answered with false before reporting a cancel
    pub cancel_after: Option<usize>,
    pub cancel_check_fails: bool,
    pub cancel_checks: AtomicUsize,
    pub states: Mutex<Vec<(JobId, JobState)>>,
}

impl FakeRemote {
    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into()),
            ..Default::default()
        }
    }

    pub fn states(&self) -> Vec<(JobId, JobState)> {
        self.states.lock().unwrap().clone()
    }

    pub fn cancel_checks(&self) -> usize {
        self.cancel_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn get_next_available_job(&self) -> Result<Option<Job>> {
        let next = self.jobs.lock().unwrap().pop_front();
        match next {
            None if self.fail_when_empty => bail!("connection refused"),
            next => Ok(next),
        }
    }

    async fn set_job_state(&self, id: &JobId, state: JobState) -> Result<()> {
        self.states.lock().unwrap().push((id.clone(), state));
        Ok(())
    }

    async fn has_been_cancelled(&self, _id: &JobId) -> Result<bool> {
        let checks = self.cancel_checks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.cancel_check_fails {
            bail!("connection reset");
        }
        Ok(self.cancel_after.is_some_and(|after| checks > after))
    }

    async fn log(&self, _: &JobId, _: &str, _: LogStream, _: &StageId) -> Result<()> {
        Ok(())
    }

    async fn set_stage_state(&self, _: &JobId, _: &StageId, _: StageState) -> Result<()> {
        Ok(())
    }

    async fn add_container(
        &self,
        _: &JobId,
        _: &ContainerId,
        _: ContainerMeta,
        _: &ContainerSpec,
        _: ContainerState,
    ) -> Result<()> {
        Ok(())
    }

    async fn set_container_state(&self, _: &ContainerId, _: ContainerState) -> Result<()> {
        Ok(())
    }

    async fn container_log(&self, _: &ContainerId, _: &str, _: LogStream) -> Result<()> {
        Ok(())
    }

    async fn search_for_value(&self, search_path: &[String], name: &str) -> Result<String> {
        Ok(format!("{}/{}", search_path.join("/"), name))
    }

    async fn search_for_secret(&self, search_path: &[String], name: &str) -> Result<String> {
        Ok(format!("secret:{}/{}", search_path.join("/"), name))
    }
}

// =============================================================================
// Workspace
// =============================================================================

/// Workspace returning a fixed spec
pub struct FakeWorkspace {
    pub spec: Option<Spec>,
    pub clean_up_fails: bool,
    pub clean_ups: AtomicUsize,
}

impl FakeWorkspace {
    pub fn new(spec: Spec) -> Self {
        Self {
            spec: Some(spec),
            clean_up_fails: false,
            clean_ups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Workspace for FakeWorkspace {
    async fn prepare(&self, _job: &Job, _work_dir: &Path) -> Result<Spec> {
        self.spec.clone().ok_or_else(|| anyhow!("no pipeline file"))
    }

    async fn clean_up(&self, _job: &Job, _work_dir: &Path) -> Result<()> {
        self.clean_ups.fetch_add(1, Ordering::SeqCst);
        if self.clean_up_fails {
            bail!("disk on fire");
        }
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn container(image: &str) -> ContainerSpec {
    ContainerSpec {
        image: image.to_string(),
        ..Default::default()
    }
}

pub fn job(id: &str) -> Job {
    Job {
        id: JobId::new(id),
        environment_id: None,
        repository: Default::default(),
        commit: Default::default(),
        state: Default::default(),
    }
}

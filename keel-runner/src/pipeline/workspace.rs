//! Job workspaces
//!
//! Preparing a workspace means getting the repository into the job's working
//! directory and parsing its pipeline file.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::domain::job::{Job, JobId};
use keel_core::domain::log::LogStream;
use keel_core::domain::pipeline::Spec;
use keel_core::domain::stage::StageId;
use tracing::debug;

use crate::environment::EnvironmentFactory;
use crate::errors::ErrorChain;
use crate::output::{LineHandler, LineWriter, OutputSink};
use crate::parser::{JsonParser, PIPELINE_FILE, Parser};
use crate::recorder::Recorder;
use crate::vcs::{CloneOptions, Vcs};

/// Stage name workspace progress is recorded against
pub const PREPARING_STAGE: &str = "preparing";

#[async_trait]
pub trait Workspace: Send + Sync {
    /// Fetches the job's sources into `work_dir` and parses its pipeline
    async fn prepare(&self, job: &Job, work_dir: &Path) -> Result<Spec>;

    /// Removes what `prepare` created
    async fn clean_up(&self, job: &Job, work_dir: &Path) -> Result<()>;
}

pub struct LocalWorkspace {
    vcs: Arc<dyn Vcs>,
    environment: Arc<dyn EnvironmentFactory>,
    recorder: Arc<dyn Recorder>,
}

impl LocalWorkspace {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        environment: Arc<dyn EnvironmentFactory>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            vcs,
            environment,
            recorder,
        }
    }

    async fn fetch_and_parse(
        &self,
        job: &Job,
        work_dir: &Path,
        progress: &mut dyn OutputSink,
    ) -> Result<Spec> {
        if !job.repository.is_local() {
            self.vcs
                .clone_repository(CloneOptions {
                    directory: work_dir,
                    repository_url: &job.repository.uri,
                    branch: &job.commit.branch,
                    revision: &job.commit.revision,
                    progress,
                })
                .await
                .context("error cloning repository")?;
        }

        let environment = self.environment.create(job.repository.search_path());
        let parser = JsonParser::new(work_dir, environment);

        debug!("Parsing {} in {}", PIPELINE_FILE, work_dir.display());
        parser
            .parse(PIPELINE_FILE)
            .await
            .context("error parsing pipeline specification")
    }
}

/// Records workspace progress lines as job logs
struct Progress {
    recorder: Arc<dyn Recorder>,
    job_id: JobId,
    stage: StageId,
}

#[async_trait]
impl LineHandler for Progress {
    async fn line(&mut self, line: &str) -> Result<()> {
        self.recorder
            .record_log(&self.job_id, line, LogStream::Stdout, &self.stage)
            .await
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn prepare(&self, job: &Job, work_dir: &Path) -> Result<Spec> {
        let mut progress = LineWriter::new(Progress {
            recorder: self.recorder.clone(),
            job_id: job.id.clone(),
            stage: StageId::new(PREPARING_STAGE),
        });

        let prepared = self.fetch_and_parse(job, work_dir, &mut progress).await;
        let closed = progress.close().await;

        match prepared {
            Ok(spec) => closed.map(|_| spec),
            Err(e) => Err(ErrorChain::append(e, closed)),
        }
    }

    async fn clean_up(&self, job: &Job, work_dir: &Path) -> Result<()> {
        if job.repository.is_local() {
            return Ok(());
        }

        match tokio::fs::remove_dir_all(work_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("error cleaning up workspace"),
        }
    }
}

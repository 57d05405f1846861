use std::path::PathBuf;

use chrono::Local;
use keel_core::domain::job::{Job, JobId, Repository};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Event, Trigger};

/// Runs a single job from the pipeline file in a local directory
#[derive(Debug, Clone)]
pub struct LocalTrigger {
    work_dir: PathBuf,
}

impl LocalTrigger {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

fn local_job() -> Job {
    Job {
        id: JobId::new(Local::now().format("local-build-%Y-%m-%d-%H-%M-%S").to_string()),
        environment_id: None,
        repository: Repository::local(),
        commit: Default::default(),
        state: Default::default(),
    }
}

impl Trigger for LocalTrigger {
    fn await_jobs(&self, cancel: CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(1);
        let work_dir = self.work_dir.clone();

        tokio::spawn(async move {
            let (state_tx, state_rx) = oneshot::channel();
            let event = Event {
                job: local_job(),
                work_dir,
                state: state_tx,
                cancel,
            };

            if tx.send(event).await.is_err() {
                warn!("Job receiver closed before the local job was handed over");
                return;
            }

            match state_rx.await {
                Ok(state) => info!("Local job finished: {}", state),
                Err(_) => warn!("Local job finished without reporting a state"),
            }
        });

        rx
    }
}

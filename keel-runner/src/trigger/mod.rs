//! Job sources
//!
//! A `Trigger` produces `Event`s, one per job to process. The consumer runs
//! the job and reports the final state back through the event's one-shot
//! channel, which is what lets the trigger move on.

mod local;
mod remote;

pub use local::LocalTrigger;
pub use remote::RemoteTrigger;

use std::path::PathBuf;

use keel_core::domain::job::{Job, JobState};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A job ready for processing
#[derive(Debug)]
pub struct Event {
    pub job: Job,
    /// Directory the job's repository lives in
    pub work_dir: PathBuf,
    /// Receives the final state of the job, exactly once
    pub state: oneshot::Sender<JobState>,
    /// Cancelled when the job should stop
    pub cancel: CancellationToken,
}

pub trait Trigger {
    /// Starts producing events until `cancel` fires or the source runs dry
    ///
    /// The channel closes when no more events will be produced.
    fn await_jobs(&self, cancel: CancellationToken) -> mpsc::Receiver<Event>;
}

//! Coordinator polling
//!
//! Claims one job at a time from the coordinator. While a job runs, a watcher
//! task polls its cancellation flag; whichever finishes first, the job or the
//! watcher, decides how the job is wound down. The final state is always
//! pushed back to the coordinator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keel_core::domain::job::{Job, JobId, JobState};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Event, Trigger};
use crate::remote::Remote;

#[derive(Clone)]
pub struct RemoteTrigger {
    remote: Arc<dyn Remote>,
    base_work_dir: PathBuf,
    poll_interval: Duration,
}

impl RemoteTrigger {
    pub fn new(remote: Arc<dyn Remote>, base_work_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            remote,
            base_work_dir: base_work_dir.into(),
            poll_interval,
        }
    }

    async fn poll(self, tx: mpsc::Sender<Event>, cancel: CancellationToken) {
        let mut slot = JobSlot::Idle;

        while !cancel.is_cancelled() {
            let job = match self.remote.get_next_available_job().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
                Err(e) => {
                    error!("error waiting for next job: {:#}", e);
                    break;
                }
            };

            info!("Claimed job {}", job.id);
            slot.claim(&job.id);
            let keep_polling = self.run_job(job, &tx, &cancel).await;
            slot.release();

            if !keep_polling {
                break;
            }
        }

        debug!("Stopped polling for jobs");
    }

    /// Hands a job over and waits for it to finish
    ///
    /// Returns false when polling should stop.
    async fn run_job(&self, job: Job, tx: &mpsc::Sender<Event>, cancel: &CancellationToken) -> bool {
        let id = job.id.clone();
        let job_cancel = cancel.child_token();
        let watcher_cancel = cancel.child_token();
        let (state_tx, mut state_rx) = oneshot::channel();

        let event = Event {
            work_dir: self.base_work_dir.join(id.as_str()),
            job,
            state: state_tx,
            cancel: job_cancel.clone(),
        };
        if tx.send(event).await.is_err() {
            warn!("Job receiver closed, dropping job {}", id);
            return false;
        }

        let (signal_tx, signal_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_cancellation(
            self.remote.clone(),
            id.clone(),
            self.poll_interval,
            watcher_cancel.clone(),
            signal_tx,
        ));

        let first = tokio::select! {
            state = &mut state_rx => Finished::Job(state.ok()),
            signal = signal_rx => Finished::Watcher(signal.ok()),
        };

        let mut keep_polling = true;
        let state = match first {
            Finished::Job(state) => state,
            Finished::Watcher(signal) => {
                match signal {
                    Some(WatchSignal::Failed(e)) => {
                        error!("error checking cancellation of job {}: {:#}", id, e);
                        keep_polling = false;
                    }
                    Some(WatchSignal::Cancelled) | None => info!("Job {} has been cancelled", id),
                }
                job_cancel.cancel();
                state_rx.await.ok()
            }
        };

        watcher_cancel.cancel();
        if let Err(e) = watcher.await {
            warn!("Cancellation watcher of job {} failed: {}", id, e);
        }

        match state {
            Some(state) => {
                if let Err(e) = self.remote.set_job_state(&id, state).await {
                    error!("error setting job state: {:#}", e);
                }
            }
            None => warn!("Job {} finished without reporting a state", id),
        }

        keep_polling
    }
}

impl Trigger for RemoteTrigger {
    fn await_jobs(&self, cancel: CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.clone().poll(tx, cancel));
        rx
    }
}

enum Finished {
    Job(Option<JobState>),
    Watcher(Option<WatchSignal>),
}

enum WatchSignal {
    Cancelled,
    Failed(anyhow::Error),
}

/// Polls the coordinator until the job is cancelled or `cancel` fires
async fn watch_cancellation(
    remote: Arc<dyn Remote>,
    id: JobId,
    interval: Duration,
    cancel: CancellationToken,
    signal: oneshot::Sender<WatchSignal>,
) {
    loop {
        let checked = tokio::select! {
            _ = cancel.cancelled() => return,
            checked = remote.has_been_cancelled(&id) => checked,
        };

        match checked {
            Ok(true) => {
                let _ = signal.send(WatchSignal::Cancelled);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                let _ = signal.send(WatchSignal::Failed(e));
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// The job this runner is busy with, at most one at a time
#[derive(Debug, Default, PartialEq, Eq)]
enum JobSlot {
    #[default]
    Idle,
    Claimed(JobId),
}

impl JobSlot {
    fn claim(&mut self, id: &JobId) {
        debug_assert!(
            *self == JobSlot::Idle,
            "claimed job {} while busy with {:?}",
            id,
            self
        );
        *self = JobSlot::Claimed(id.clone());
    }

    fn release(&mut self) {
        *self = JobSlot::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRemote, job};

    fn trigger(remote: &Arc<FakeRemote>) -> RemoteTrigger {
        RemoteTrigger::new(remote.clone(), "/tmp/keel", Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_state_is_pushed() {
        let remote = Arc::new(FakeRemote {
            fail_when_empty: true,
            ..FakeRemote::with_jobs(vec![job("job-1")])
        });
        let mut events = trigger(&remote).await_jobs(CancellationToken::new());

        let event = events.recv().await.unwrap();
        assert_eq!(event.job.id.as_str(), "job-1");
        assert_eq!(event.work_dir, PathBuf::from("/tmp/keel/job-1"));
        event.state.send(JobState::Success).unwrap();

        assert!(events.recv().await.is_none());
        assert_eq!(remote.states(), vec![(JobId::new("job-1"), JobState::Success)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_cancellation() {
        let remote = Arc::new(FakeRemote {
            fail_when_empty: true,
            cancel_after: Some(2),
            ..FakeRemote::with_jobs(vec![job("job-1")])
        });
        let mut events = trigger(&remote).await_jobs(CancellationToken::new());

        let event = events.recv().await.unwrap();
        event.cancel.cancelled().await;
        event.state.send(JobState::Cancelled).unwrap();

        assert!(events.recv().await.is_none());
        assert_eq!(remote.states(), vec![(JobId::new("job-1"), JobState::Cancelled)]);

        let checks = remote.cancel_checks();
        assert_eq!(checks, 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.cancel_checks(), checks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_failure_stops_polling() {
        let remote = Arc::new(FakeRemote {
            cancel_check_fails: true,
            ..FakeRemote::with_jobs(vec![job("job-1"), job("job-2")])
        });
        let mut events = trigger(&remote).await_jobs(CancellationToken::new());

        let event = events.recv().await.unwrap();
        event.cancel.cancelled().await;
        event.state.send(JobState::Cancelled).unwrap();

        assert!(events.recv().await.is_none());
        assert_eq!(remote.states(), vec![(JobId::new("job-1"), JobState::Cancelled)]);
        assert_eq!(remote.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_idle_polling() {
        let remote = Arc::new(FakeRemote::default());
        let cancel = CancellationToken::new();
        let mut events = trigger(&remote).await_jobs(cancel.clone());

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();

        assert!(events.recv().await.is_none());
        assert!(remote.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_running_job() {
        let remote = Arc::new(FakeRemote::with_jobs(vec![job("job-1")]));
        let cancel = CancellationToken::new();
        let mut events = trigger(&remote).await_jobs(cancel.clone());

        let event = events.recv().await.unwrap();
        cancel.cancel();
        event.cancel.cancelled().await;
        event.state.send(JobState::Cancelled).unwrap();

        assert!(events.recv().await.is_none());
        assert_eq!(remote.states(), vec![(JobId::new("job-1"), JobState::Cancelled)]);
    }

    #[test]
    fn test_job_slot() {
        let mut slot = JobSlot::default();
        slot.claim(&JobId::new("a"));
        assert_eq!(slot, JobSlot::Claimed(JobId::new("a")));

        slot.release();
        assert_eq!(slot, JobSlot::Idle);
        slot.claim(&JobId::new("b"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "while busy with")]
    fn test_job_slot_double_claim() {
        let mut slot = JobSlot::default();
        slot.claim(&JobId::new("a"));
        slot.claim(&JobId::new("b"));
    }
}

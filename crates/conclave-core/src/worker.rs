//! Background execution of runs.
//!
//! Runs are queued over a bounded channel and executed by a single
//! scheduling task, at most `concurrency` at a time. Each enqueued run gets
//! a `watch` channel that follows its status until it is terminal.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn, Instrument};

use crate::domain::{ConclaveError, Result, RunId, RunStatus};
use crate::obs;
use crate::runner::PhaseRunner;

const QUEUE_CAPACITY: usize = 64;

struct Job {
    run_id: RunId,
    status: watch::Sender<RunStatus>,
}

pub struct RunWorker {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl RunWorker {
    /// Start the scheduling task on the current runtime.
    pub fn spawn(runner: Arc<PhaseRunner>, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let scheduler = tokio::spawn(schedule(runner, rx, concurrency.max(1)));
        Self {
            tx: Mutex::new(Some(tx)),
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Queue `run_id` for execution and return a receiver that tracks its status.
    pub async fn enqueue(&self, run_id: RunId) -> Result<watch::Receiver<RunStatus>> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ConclaveError::InvalidState("run worker is shut down".to_string()))?;

        let (status, rx) = watch::channel(RunStatus::Planned);
        debug!(run_id = %run_id, "run queued");
        tx.send(Job { run_id, status })
            .await
            .map_err(|_| ConclaveError::InvalidState("run worker stopped".to_string()))?;
        Ok(rx)
    }

    /// Stop accepting work, then wait for queued and in-flight runs to finish.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = scheduler {
            if let Err(err) = handle.await {
                warn!(error = %err, "run worker scheduler ended abnormally");
            }
        }
        info!("run worker stopped");
    }
}

async fn schedule(runner: Arc<PhaseRunner>, mut rx: mpsc::Receiver<Job>, concurrency: usize) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        // Reap finished runs so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}

        let runner = Arc::clone(&runner);
        tasks.spawn(async move {
            let _permit = permit;
            execute(&runner, job).await;
        });
    }

    while tasks.join_next().await.is_some() {}
}

async fn execute(runner: &PhaseRunner, job: Job) {
    let Job { run_id, status } = job;
    status.send_replace(RunStatus::Running);

    let span = obs::run_span(run_id.as_str());
    let final_status = match runner.execute(&run_id).instrument(span).await {
        Ok(run) => run.status,
        Err(err) => {
            warn!(run_id = %run_id, error = %err, "run ended with an error");
            match runner.runs().get_run(&run_id).await {
                Ok(run) if run.status.is_terminal() => run.status,
                _ => RunStatus::Failed,
            }
        }
    };
    status.send_replace(final_status);
}

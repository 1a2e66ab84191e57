use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{dispatcher::Dispatcher, job::runner::JobRunner, SchedoError};

/// Identifies a worker within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }
}

impl From<usize> for WorkerId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A fixed number of workers pulling from the dispatcher's queues.
///
/// Each worker holds at most one job at a time and only dequeues when idle.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        concurrency: usize,
        dispatcher: Dispatcher,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..concurrency)
            .map(|id| {
                let runner = JobRunner::new(dispatcher.clone(), WorkerId::new(id), heartbeat_interval);
                tokio::spawn(run_worker(runner, shutdown.clone()))
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to finish its current job and exit.
    pub(crate) async fn join(self) -> Result<(), SchedoError> {
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|result| result.map_err(|_| SchedoError::GracefulShutdownFailed))
    }
}

async fn run_worker(runner: JobRunner, shutdown: CancellationToken) {
    let owner = runner.owner();
    tracing::debug!(%owner, "Starting worker {owner}");
    while let Some(job_id) = runner
        .dispatcher()
        .queue()
        .dequeue_blocking(owner, &shutdown)
        .await
    {
        runner.execute_job(job_id).await;
    }
    tracing::debug!(%owner, "Shutting down worker {owner}");
}

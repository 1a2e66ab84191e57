//! Priority job dispatch with bounded retries, exponential backoff and periodic triggers.
//!
//! Jobs are submitted through a [`Dispatcher`], persisted to a [`ResultStore`] and placed on
//! one of two priority queues. A fixed pool of workers runs them with the [`Executor`]
//! registered for their kind; failures are retried with exponential backoff until the job's
//! `max_attempts` is exhausted. Recurring jobs are submitted by a scheduler on fixed intervals
//! or cron schedules.
//!
//! # Example
//!
//! ```
//! # use schedo::prelude::*;
//! # use schedo::store::memory::InMemoryResultStore;
//! # use std::time::Duration;
//! struct ProcessData;
//!
//! #[async_trait::async_trait]
//! impl Executor for ProcessData {
//!     type Data = String;
//!     type Output = usize;
//!     const NAME: &'static str = "process_data";
//!     const BASE_DELAY: Duration = Duration::from_secs(15);
//!
//!     async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
//!         Ok(job.data.len())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SchedoError> {
//! let running = Schedo::new(Config::new(), InMemoryResultStore::new())
//!     .with_executor(ProcessData)
//!     .start()?;
//!
//! let job_id = ProcessData::builder()
//!     .with_data("some rows".to_owned())
//!     .enqueue(running.dispatcher())
//!     .await?;
//! let record = running.dispatcher().get_state(job_id).await?;
//! assert_eq!(record.kind, "process_data");
//!
//! running.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod queue;
mod reaper;
pub mod scheduler;
pub mod store;
pub mod worker;

use config::{Config, ConfigError};
use dispatcher::Dispatcher;
use executor::{Executor, Registry};
use queue::PriorityQueueSet;
use reaper::Reaper;
use scheduler::{PeriodicJob, Scheduler, Trigger};
use store::{ResultStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::WorkerPool;

/// Builder for a dispatcher together with its worker pool, scheduler and reaper.
pub struct Schedo {
    config: Config,
    store: Arc<dyn ResultStore>,
    registry: Registry,
    periodic: Vec<PeriodicJob>,
}

impl Schedo {
    pub fn new(config: Config, store: impl ResultStore + 'static) -> Self {
        Self {
            config,
            store: Arc::new(store),
            registry: Default::default(),
            periodic: Default::default(),
        }
    }

    /// Register the body for jobs of kind [`Executor::NAME`].
    pub fn with_executor<E: Executor>(mut self, executor: E) -> Self {
        self.registry.register(executor);
        self
    }

    /// Add a recurring job. Its kind must be registered with [`Schedo::with_executor`].
    pub fn with_periodic(mut self, job: PeriodicJob) -> Self {
        self.periodic.push(job);
        self
    }

    /// Spawn the workers, the scheduler and the reaper onto the current tokio runtime.
    pub fn start(self) -> Result<Running, SchedoError> {
        self.config.validate()?;
        for job in &self.periodic {
            if !self.registry.contains(&job.kind) {
                return Err(SchedoError::UnknownKind(job.kind.clone()));
            }
            if matches!(job.trigger, Trigger::Every(interval) if interval.is_zero()) {
                return Err(SchedoError::InvalidJob(
                    "periodic interval must be greater than zero",
                ));
            }
        }

        let queue = Arc::new(PriorityQueueSet::new(
            self.config.fairness,
            self.config.claim_timeout,
        ));
        let dispatcher = Dispatcher::new(
            self.store,
            queue,
            self.registry,
            self.config.retry_policy,
        );
        let shutdown = CancellationToken::new();

        tracing::debug!(
            concurrency = self.config.concurrency,
            periodic = self.periodic.len(),
            "Starting schedo"
        );
        let workers = WorkerPool::spawn(
            self.config.concurrency,
            dispatcher.clone(),
            self.config.heartbeat_interval,
            shutdown.clone(),
        );
        let scheduler = Scheduler::new(dispatcher.clone(), self.periodic).spawn(shutdown.clone());
        let reaper =
            Reaper::new(dispatcher.clone(), self.config.reap_interval).spawn(shutdown.clone());

        Ok(Running {
            dispatcher,
            shutdown,
            workers,
            tasks: vec![scheduler, reaper],
        })
    }
}

/// Handle to a started [`Schedo`].
pub struct Running {
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    workers: WorkerPool,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stop the scheduler and the reaper and wait for every worker to finish its current job.
    ///
    /// Jobs still queued or waiting for a retry stay in their current state in the store.
    pub async fn graceful_shutdown(self) -> Result<(), SchedoError> {
        tracing::debug!("Shutting down schedo tasks");
        self.shutdown.cancel();
        futures::future::join_all(self.tasks)
            .await
            .into_iter()
            .try_for_each(|result| result.map_err(|_| SchedoError::GracefulShutdownFailed))?;
        self.workers.join().await
    }
}

#[derive(Debug, Error)]
pub enum SchedoError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the result store: {0}")]
    Store(#[from] StoreError),
    #[error("No executor registered for job kind {0}")]
    UnknownKind(String),
    #[error("Invalid job: {0}")]
    InvalidJob(&'static str),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        executor::test::{MockBehaviour, MockExecutor, SimpleExecutor},
        job::{ErrorKind, JobId, JobRecord, JobState, Priority},
        store::memory::InMemoryResultStore,
    };

    fn config() -> Config {
        Config::new()
            .with_concurrency(2)
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_reap_interval(Duration::from_millis(100))
    }

    async fn submit(running: &Running, behaviour: MockBehaviour) -> JobId {
        running
            .dispatcher()
            .submit(
                MockExecutor::NAME,
                serde_json::to_value(behaviour).unwrap(),
                Priority::Normal,
                MockExecutor::MAX_ATTEMPTS,
                MockExecutor::BASE_DELAY,
            )
            .await
            .unwrap()
    }

    async fn wait_for_terminal(running: &Running, job_id: JobId) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = running.dispatcher().get_state(job_id).await.unwrap();
                if record.state.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn setup() {
        let running = Schedo::new(Config::new(), InMemoryResultStore::new())
            .with_executor(SimpleExecutor)
            .start()
            .unwrap();

        running.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn always_failing_job_runs_max_attempts_times() {
        let executor = MockExecutor::default();
        let running = Schedo::new(config(), InMemoryResultStore::new())
            .with_executor(executor.clone())
            .start()
            .unwrap();

        let job_id = submit(&running, MockBehaviour::Transient).await;
        let record = wait_for_terminal(&running, job_id).await;

        assert_eq!(executor.executions(), 3);
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempt, 3);
        assert_eq!(record.errors.len(), 3);
        assert_eq!(
            record.errors.iter().map(|error| error.attempt).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RetriesExhausted);
        assert_eq!(error.message, "transient");

        running.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn successful_job_runs_once() {
        let executor = MockExecutor::default();
        let running = Schedo::new(config(), InMemoryResultStore::new())
            .with_executor(executor.clone())
            .start()
            .unwrap();

        let job_id = submit(&running, MockBehaviour::Echo("hello".to_owned())).await;
        let record = wait_for_terminal(&running, job_id).await;

        assert_eq!(executor.executions(), 1);
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.result, Some(json!("hello")));
        assert_eq!(record.error, None);
        assert!(record.started_at.is_some());
        assert!(record.finished_at >= record.started_at);

        running.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn job_recovers_after_transient_failures() {
        let executor = MockExecutor::default();
        let running = Schedo::new(config(), InMemoryResultStore::new())
            .with_executor(executor.clone())
            .start()
            .unwrap();

        let job_id = submit(&running, MockBehaviour::FailTimes(2)).await;
        let record = wait_for_terminal(&running, job_id).await;

        assert_eq!(executor.executions(), 3);
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.attempt, 2);
        assert_eq!(record.errors.len(), 2);
        assert_eq!(record.result, Some(json!("recovered")));

        running.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn permanent_failure_runs_once() {
        let executor = MockExecutor::default();
        let running = Schedo::new(config(), InMemoryResultStore::new())
            .with_executor(executor.clone())
            .start()
            .unwrap();

        let job_id = submit(&running, MockBehaviour::Permanent).await;
        let record = wait_for_terminal(&running, job_id).await;

        assert_eq!(executor.executions(), 1);
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.unwrap().kind, ErrorKind::PermanentFailure);

        running.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hard_time_limit_frees_the_worker() {
        let running = Schedo::new(config().with_concurrency(1), InMemoryResultStore::new())
            .with_executor(MockExecutor::default())
            .start()
            .unwrap();
        let start = Instant::now();

        let slow = submit(&running, MockBehaviour::Sleep { millis: 5000 }).await;
        let quick = submit(&running, MockBehaviour::Echo("quick".to_owned())).await;

        let record = wait_for_terminal(&running, slow).await;
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.unwrap().kind, ErrorKind::TimeoutFailure);

        let record = wait_for_terminal(&running, quick).await;
        assert_eq!(record.state, JobState::Succeeded);
        assert!(start.elapsed() < Duration::from_secs(2));

        running.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_soft_time_limit_is_a_timeout() {
        let executor = MockExecutor::default();
        let running = Schedo::new(config(), InMemoryResultStore::new())
            .with_executor(executor.clone())
            .start()
            .unwrap();

        let job_id = submit(&running, MockBehaviour::SleepUntilCancelled { millis: 5000 }).await;
        let record = wait_for_terminal(&running, job_id).await;

        assert_eq!(executor.executions(), 1);
        assert_eq!(record.state, JobState::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TimeoutFailure);
        assert_eq!(error.message, "stopped early");

        running.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_jobs() {
        let running = Schedo::new(config(), InMemoryResultStore::new())
            .with_executor(MockExecutor::default())
            .start()
            .unwrap();
        let dispatcher = running.dispatcher().clone();

        let job_id = submit(&running, MockBehaviour::Sleep { millis: 100 }).await;
        while dispatcher.get_state(job_id).await.unwrap().state != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        running.graceful_shutdown().await.unwrap();

        assert_eq!(
            dispatcher.get_state(job_id).await.unwrap().state,
            JobState::Succeeded
        );
    }

    #[tokio::test]
    async fn periodic_job_of_unknown_kind_is_rejected() {
        let result = Schedo::new(Config::new(), InMemoryResultStore::new())
            .with_periodic(PeriodicJob::every::<SimpleExecutor>(Duration::from_secs(1)))
            .start();

        assert_matches!(
            result.err(),
            Some(SchedoError::UnknownKind(kind)) if kind == SimpleExecutor::NAME
        );
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let result = Schedo::new(Config::new(), InMemoryResultStore::new())
            .with_executor(SimpleExecutor)
            .with_periodic(PeriodicJob::every::<SimpleExecutor>(Duration::ZERO))
            .start();

        assert_matches!(result.err(), Some(SchedoError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = Schedo::new(Config::new().with_concurrency(0), InMemoryResultStore::new())
            .start();

        assert_matches!(
            result.err(),
            Some(SchedoError::Config(ConfigError::Concurrency))
        );
    }
}

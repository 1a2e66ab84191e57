use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::{
    task::JoinError,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    dispatcher::Dispatcher,
    executor::{DynExecutor, Failure},
    queue::deadline,
    store::StoreError,
    worker::WorkerId,
};

use super::{ErrorKind, JobError, JobId, JobRecord};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_TIMEOUT: &str = "timeout";
const ERROR_TYPE_UNKNOWN_KIND: &str = "unknown_kind";
const ERROR_TYPE_LEASE_LOST: &str = "lease_lost";

/// The classified outcome of a failed attempt, before it is stamped onto the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttemptFailure {
    pub(crate) kind: ErrorKind,
    pub(crate) error_type: String,
    pub(crate) message: String,
}

impl AttemptFailure {
    pub(crate) fn transient(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransientFailure,
            error_type: error_type.to_owned(),
            message: message.into(),
        }
    }

    fn timeout(limit: Duration) -> Self {
        Self {
            kind: ErrorKind::TimeoutFailure,
            error_type: ERROR_TYPE_TIMEOUT.to_owned(),
            message: format!("Job failed to complete within hard time limit: {limit:?}"),
        }
    }

    fn unknown_kind(kind: &str) -> Self {
        Self {
            kind: ErrorKind::PermanentFailure,
            error_type: ERROR_TYPE_UNKNOWN_KIND.to_owned(),
            message: format!("No executor registered for job kind {kind}"),
        }
    }

    /// A failure raised after the soft time limit asked the body to stop counts as a timeout.
    fn after_soft_limit(self) -> Self {
        Self {
            kind: ErrorKind::TimeoutFailure,
            ..self
        }
    }

    pub(crate) fn into_job_error(
        self,
        attempt: u16,
        kind: ErrorKind,
        recorded_at: DateTime<Utc>,
    ) -> JobError {
        JobError {
            attempt,
            kind,
            error_type: self.error_type,
            message: self.message,
            recorded_at,
        }
    }
}

impl From<Failure> for AttemptFailure {
    fn from(value: Failure) -> Self {
        Self {
            kind: value.kind(),
            error_type: value.error().error_type().to_owned(),
            message: value.error().to_string(),
        }
    }
}

impl From<JoinError> for AttemptFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::transient(ERROR_TYPE_PANIC, message)
    }
}

/// Runs the jobs dequeued by a single worker.
pub(crate) struct JobRunner {
    dispatcher: Dispatcher,
    owner: WorkerId,
    heartbeat_interval: Duration,
}

impl JobRunner {
    pub(crate) fn new(dispatcher: Dispatcher, owner: WorkerId, heartbeat_interval: Duration) -> Self {
        Self {
            dispatcher,
            owner,
            heartbeat_interval,
        }
    }

    pub(crate) fn owner(&self) -> WorkerId {
        self.owner
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Claim, execute and settle a single dequeued job.
    ///
    /// Never fails: errors are logged and the lease is left for the reaper or released.
    #[instrument(skip(self), fields(worker = %self.owner))]
    pub(crate) async fn execute_job(&self, job_id: JobId) {
        let record = match self.dispatcher.claim(job_id, self.owner).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(error @ StoreError::InvalidTransition { .. }) => {
                tracing::warn!(%job_id, ?error, "Dropping job {job_id} which cannot run: {error}");
                self.dispatcher.queue().ack(job_id, self.owner);
                return;
            }
            Err(error) => {
                tracing::error!(%job_id, ?error, "Failed to claim job {job_id}: {error}");
                self.dispatcher.queue().release(job_id, self.owner);
                return;
            }
        };

        let outcome = match self.dispatcher.executor(&record.kind) {
            Some(executor) => self.run(executor, record.clone()).await,
            None => Err(AttemptFailure::unknown_kind(&record.kind)),
        };

        let _ = self
            .dispatcher
            .finish(self.owner, record, outcome)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    %job_id,
                    ?error,
                    "Failed to record the outcome of job {job_id}, error: {error}",
                )
            });
    }

    async fn run(
        &self,
        executor: Arc<dyn DynExecutor>,
        record: JobRecord,
    ) -> Result<Value, AttemptFailure> {
        let job_id = record.id;
        let soft_time_limit = record.soft_time_limit;
        let hard_time_limit = record.hard_time_limit;
        let cancellation = CancellationToken::new();
        let start = Instant::now();

        tracing::debug!(%job_id, attempt = record.attempt, "Executing job {job_id}");
        let mut handle = tokio::spawn({
            let cancellation = cancellation.clone();
            async move { executor.execute_record(record, cancellation).await }.in_current_span()
        });

        let soft_deadline = sleep_until(deadline(start, soft_time_limit));
        let hard_deadline = sleep_until(deadline(start, hard_time_limit));
        tokio::pin!(soft_deadline, hard_deadline);
        let mut heartbeat = interval_at(
            deadline(start, self.heartbeat_interval),
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut soft_limit_exceeded = false;

        loop {
            tokio::select! {
                biased;
                result = &mut handle => {
                    return match result {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(failure)) if soft_limit_exceeded => {
                            Err(AttemptFailure::from(failure).after_soft_limit())
                        }
                        Ok(Err(failure)) => Err(failure.into()),
                        Err(error) => Err(error.into()),
                    };
                }
                _ = &mut hard_deadline => {
                    handle.abort();
                    tracing::warn!(%job_id, "Job {job_id} exceeded its hard time limit of {hard_time_limit:?}");
                    return Err(AttemptFailure::timeout(hard_time_limit));
                }
                _ = &mut soft_deadline, if !soft_limit_exceeded => {
                    soft_limit_exceeded = true;
                    cancellation.cancel();
                    tracing::warn!(%job_id, "Job {job_id} exceeded its soft time limit of {soft_time_limit:?}");
                }
                _ = heartbeat.tick() => {
                    if !self.dispatcher.queue().touch(job_id, self.owner) {
                        handle.abort();
                        tracing::warn!(%job_id, "Lost the lease on job {job_id}, abandoning it");
                        return Err(AttemptFailure::transient(
                            ERROR_TYPE_LEASE_LOST,
                            "The job was reclaimed while running",
                        ));
                    }
                }
            }
        }
    }
}

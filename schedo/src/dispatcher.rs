//! The submission and polling surface, and the state transitions made on behalf of workers.
//!
//! Every transition is written to the [`ResultStore`] before the [`PriorityQueueSet`] is
//! mutated, so a job is never visible in a queue in a state the store does not yet reflect.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::instrument;

use crate::{
    backoff::{RetryDecision, RetryPolicy},
    executor::{DynExecutor, Registry},
    job::{runner::AttemptFailure, ErrorKind, JobId, JobRecord, JobState, Priority},
    queue::PriorityQueueSet,
    store::{ResultStore, StoreError},
    worker::WorkerId,
    SchedoError,
};

const ERROR_TYPE_ORPHANED: &str = "orphaned";

/// A job ready to be submitted; unset fields fall back to the kind's defaults.
#[derive(Debug, Clone)]
pub(crate) struct EnqueuableJob {
    pub(crate) kind: String,
    pub(crate) payload: Value,
    pub(crate) priority: Option<Priority>,
    pub(crate) max_attempts: Option<u16>,
    pub(crate) base_delay: Option<Duration>,
}

impl EnqueuableJob {
    pub(crate) fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: None,
            max_attempts: None,
            base_delay: None,
        }
    }
}

struct Inner {
    store: Arc<dyn ResultStore>,
    queue: Arc<PriorityQueueSet>,
    registry: Registry,
    retry_policy: RetryPolicy,
}

/// Submits jobs and reports their state.
///
/// Cloning is cheap; clones share the same queues and store.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<PriorityQueueSet>,
        registry: Registry,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                queue,
                registry,
                retry_policy,
            }),
        }
    }

    /// Submit a job of the given kind.
    ///
    /// The job is persisted as `Queued` before it becomes visible to workers; if that write
    /// fails the error is returned and nothing is enqueued.
    pub async fn submit(
        &self,
        kind: &str,
        payload: Value,
        priority: Priority,
        max_attempts: u16,
        base_delay: Duration,
    ) -> Result<JobId, SchedoError> {
        self.enqueue(EnqueuableJob {
            kind: kind.to_owned(),
            payload,
            priority: Some(priority),
            max_attempts: Some(max_attempts),
            base_delay: Some(base_delay),
        })
        .await
    }

    /// The latest snapshot of a job.
    pub async fn get_state(&self, job_id: JobId) -> Result<JobRecord, SchedoError> {
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or(SchedoError::Store(StoreError::JobNotFound(job_id)))
    }

    /// The queues shared with the worker pool.
    pub fn queue(&self) -> &PriorityQueueSet {
        &self.inner.queue
    }

    #[instrument(skip(self, job), fields(kind = %job.kind))]
    pub(crate) async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, SchedoError> {
        let defaults = self
            .inner
            .registry
            .defaults(&job.kind)
            .ok_or_else(|| SchedoError::UnknownKind(job.kind.clone()))?;
        let max_attempts = job.max_attempts.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(SchedoError::InvalidJob("max_attempts must be at least 1"));
        }

        let record = JobRecord::new(
            job.kind,
            job.payload,
            job.priority.unwrap_or(defaults.priority),
            max_attempts,
            job.base_delay.unwrap_or(defaults.base_delay),
            &defaults,
            Utc::now(),
        );
        let job_id = record.id;
        let priority = record.priority;

        self.inner.store.put(record).await.inspect_err(|err| {
            tracing::error!(?err, %job_id, "Failed to persist job {job_id}, not enqueuing: {err}")
        })?;
        self.inner.queue.enqueue(priority, job_id);
        tracing::debug!(%job_id, %priority, "Enqueued job {job_id}");

        Ok(job_id)
    }

    pub(crate) fn executor(&self, kind: &str) -> Option<Arc<dyn DynExecutor>> {
        self.inner.registry.get(kind)
    }

    /// Mark a dequeued job as running on `owner`.
    ///
    /// Returns `None` when the store has no record of the job, in which case the lease is
    /// dropped.
    pub(crate) async fn claim(
        &self,
        job_id: JobId,
        owner: WorkerId,
    ) -> Result<Option<JobRecord>, StoreError> {
        let Some(mut record) = self.inner.store.get(job_id).await? else {
            tracing::warn!(%job_id, "Dequeued job {job_id} has no stored record, dropping it");
            self.inner.queue.ack(job_id, owner);
            return Ok(None);
        };

        record.mark_running(owner, Utc::now())?;
        self.inner.store.put(record.clone()).await?;
        self.inner
            .queue
            .extend_lease(job_id, owner, record.hard_time_limit);

        Ok(Some(record))
    }

    /// Record the outcome of an attempt made by `owner`.
    ///
    /// The outcome is discarded if `owner` no longer holds the lease, for instance because the
    /// reaper reclaimed the job in the meantime.
    pub(crate) async fn finish(
        &self,
        owner: WorkerId,
        record: JobRecord,
        outcome: Result<Value, AttemptFailure>,
    ) -> Result<(), StoreError> {
        let job_id = record.id;
        if !self.inner.queue.begin_settle(job_id, owner) {
            tracing::warn!(%job_id, %owner, "Discarding stale outcome of job {job_id}");
            return Ok(());
        }

        let result = match outcome {
            Ok(value) => self.settle_success(owner, record, value).await,
            Err(failure) => self.settle_failure(owner, record, failure).await,
        };
        if result.is_err() {
            self.inner.queue.abandon_settle(job_id, owner);
        }
        result
    }

    /// Recover a job whose owner stopped sending heartbeats.
    ///
    /// The caller must have claimed the settlement through [`PriorityQueueSet::orphaned`].
    pub(crate) async fn reclaim(&self, job_id: JobId, owner: WorkerId) -> Result<(), StoreError> {
        let record = match self.inner.store.get(job_id).await {
            Ok(record) => record,
            Err(err) => {
                self.inner.queue.abandon_settle(job_id, owner);
                return Err(err);
            }
        };

        match record {
            Some(record) if record.state == JobState::Running => {
                let failure = AttemptFailure::transient(
                    ERROR_TYPE_ORPHANED,
                    format!("Worker {owner} stopped sending heartbeats"),
                );
                let result = self.settle_failure(owner, record, failure).await;
                if result.is_err() {
                    self.inner.queue.abandon_settle(job_id, owner);
                }
                result
            }
            Some(record) if !record.state.is_terminal() => {
                tracing::debug!(%job_id, "Job {job_id} was never marked as running, requeuing");
                self.inner.queue.release(job_id, owner);
                Ok(())
            }
            _ => {
                self.inner.queue.ack(job_id, owner);
                Ok(())
            }
        }
    }

    async fn settle_success(
        &self,
        owner: WorkerId,
        mut record: JobRecord,
        value: Value,
    ) -> Result<(), StoreError> {
        let job_id = record.id;
        record.mark_succeeded(value, Utc::now())?;
        self.inner.store.put(record).await?;
        self.inner.queue.ack(job_id, owner);
        tracing::debug!(%job_id, "Job complete {job_id}");
        Ok(())
    }

    async fn settle_failure(
        &self,
        owner: WorkerId,
        mut record: JobRecord,
        failure: AttemptFailure,
    ) -> Result<(), StoreError> {
        let job_id = record.id;
        let attempt = record.attempt;
        let now = Utc::now();
        let decision = self.inner.retry_policy.evaluate(
            attempt,
            record.max_attempts,
            record.base_delay,
            failure.kind,
        );

        match decision {
            RetryDecision::Retry { after } => {
                tracing::warn!(
                    %job_id,
                    ?failure,
                    "Job {job_id} failed and will be retried in {after:?}: error type: {}, message: {}",
                    failure.error_type,
                    failure.message
                );
                let error = failure.into_job_error(attempt, ErrorKind::TransientFailure, now);
                record.mark_retrying(error, scheduled_at(now, after))?;
                self.inner.store.put(record).await?;
                self.inner.queue.ack_and_retry(job_id, owner, after);
            }
            RetryDecision::GiveUp => {
                let kind = match failure.kind {
                    ErrorKind::TransientFailure => ErrorKind::RetriesExhausted,
                    kind => kind,
                };
                tracing::error!(
                    %job_id,
                    ?failure,
                    "Job {job_id} failed and will be discarded: error type: {}, message: {}",
                    failure.error_type,
                    failure.message
                );
                let error = failure.into_job_error(attempt, kind, now);
                record.mark_failed(error, now)?;
                self.inner.store.put(record).await?;
                self.inner.queue.ack(job_id, owner);
            }
        }
        Ok(())
    }
}

fn scheduled_at(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(after)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

use std::{error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::job::{builder::JobBuilder, ErrorKind, Job, JobRecord, Priority};

/// The body of a job kind.
///
/// An executor is registered once with [`crate::Schedo::with_executor`] and shared by every
/// worker; jobs are routed to it by [`Executor::NAME`].
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The type representing the job's payload.
    ///
    /// If this is not needed it can be set to unit `()`.
    type Data: Serialize + DeserializeOwned + Send;
    /// The type stored as the job's result on success.
    type Output: Serialize + Send;
    /// The name of the executor, used as the job kind.
    ///
    /// This should be unique across the executors registered with a single dispatcher.
    const NAME: &'static str;
    /// The maximum number of times a job is executed before it is failed.
    ///
    /// When enqueuing any given job this can be overridden via
    /// [`JobBuilder::with_max_attempts`].
    const MAX_ATTEMPTS: u16 = 3;
    /// The delay before the first retry. Later retries back off exponentially.
    const BASE_DELAY: Duration = Duration::from_secs(15);
    /// After this long the job is asked to stop via [`Job::cancelled`].
    const SOFT_TIME_LIMIT: Duration = Duration::from_secs(500);
    /// After this long the job is abandoned and failed with a timeout.
    const HARD_TIME_LIMIT: Duration = Duration::from_secs(600);
    /// The priority used when the submitter does not choose one.
    const PRIORITY: Priority = Priority::Normal;

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output>;

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
    {
        Default::default()
    }
}

pub type ExecutionResult<T> = Result<T, Failure>;

pub trait ExecutionError: Error + Send + Sync {
    fn error_type(&self) -> &'static str;
}

/// A classified failure returned by a job body.
///
/// Any [`ExecutionError`] converts into a transient failure, so `?` retries by default.
/// Return [`Failure::permanent`] to fail the job straight away.
#[derive(Debug)]
pub enum Failure {
    Transient(Box<dyn ExecutionError>),
    Permanent(Box<dyn ExecutionError>),
}

impl Failure {
    pub fn transient(error: impl ExecutionError + 'static) -> Self {
        Self::Transient(Box::new(error))
    }

    pub fn permanent(error: impl ExecutionError + 'static) -> Self {
        Self::Permanent(Box::new(error))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientFailure,
            Self::Permanent(_) => ErrorKind::PermanentFailure,
        }
    }

    pub fn error(&self) -> &dyn ExecutionError {
        match self {
            Self::Transient(error) | Self::Permanent(error) => error.as_ref(),
        }
    }
}

impl<T> From<T> for Failure
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::transient(value)
    }
}

#[derive(Debug, Error)]
enum PayloadError {
    #[error("Failed to decode job payload: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Failed to encode job result: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ExecutionError for PayloadError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
        }
    }
}

/// The per kind settings copied onto a job when it is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindDefaults {
    pub max_attempts: u16,
    pub base_delay: Duration,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub priority: Priority,
}

impl Default for KindDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(15),
            soft_time_limit: Duration::from_secs(500),
            hard_time_limit: Duration::from_secs(600),
            priority: Priority::Normal,
        }
    }
}

#[async_trait]
pub(crate) trait DynExecutor: Send + Sync {
    fn defaults(&self) -> KindDefaults;

    async fn execute_record(
        &self,
        record: JobRecord,
        cancellation: CancellationToken,
    ) -> Result<Value, Failure>;
}

#[async_trait]
impl<E> DynExecutor for E
where
    E: Executor,
{
    fn defaults(&self) -> KindDefaults {
        KindDefaults {
            max_attempts: E::MAX_ATTEMPTS,
            base_delay: E::BASE_DELAY,
            soft_time_limit: E::SOFT_TIME_LIMIT,
            hard_time_limit: E::HARD_TIME_LIMIT,
            priority: E::PRIORITY,
        }
    }

    async fn execute_record(
        &self,
        record: JobRecord,
        cancellation: CancellationToken,
    ) -> Result<Value, Failure> {
        let job = Job::<E::Data>::from_record(&record, cancellation)
            .map_err(|err| Failure::permanent(PayloadError::Decode(err)))?;
        let output = self.execute(job).await?;
        serde_json::to_value(output).map_err(|err| Failure::permanent(PayloadError::Encode(err)))
    }
}

/// Executors keyed by job kind.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    executors: FxHashMap<&'static str, Arc<dyn DynExecutor>>,
}

impl Registry {
    pub(crate) fn register<E: Executor>(&mut self, executor: E) {
        if self
            .executors
            .insert(E::NAME, Arc::new(executor))
            .is_some()
        {
            tracing::warn!(kind = E::NAME, "Replaced executor for job kind {}", E::NAME);
        }
    }

    pub(crate) fn get(&self, kind: &str) -> Option<Arc<dyn DynExecutor>> {
        self.executors.get(kind).cloned()
    }

    pub(crate) fn defaults(&self, kind: &str) -> Option<KindDefaults> {
        self.executors.get(kind).map(|executor| executor.defaults())
    }

    pub(crate) fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }
}

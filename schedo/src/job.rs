use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod builder;
mod record;
pub(crate) mod runner;

pub use record::{ErrorKind, JobError, JobRecord, JobState};

/// Opaque identifier assigned to a job when it is submitted.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The scheduling tier of a job.
///
/// `High` jobs are dequeued ahead of `Normal` ones, subject to the configured
/// [`crate::queue::Fairness`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::High => 1,
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::High => f.write_str("high"),
        }
    }
}

/// The typed view of a job handed to [`crate::executor::Executor::execute`].
#[derive(Debug)]
pub struct Job<D> {
    pub id: JobId,
    pub kind: String,
    pub data: D,
    pub priority: Priority,
    pub attempt: u16,
    pub max_attempts: u16,
    pub enqueued_at: DateTime<Utc>,
    cancellation: CancellationToken,
}

impl<D> Job<D>
where
    D: DeserializeOwned,
{
    pub(crate) fn from_record(
        record: &JobRecord,
        cancellation: CancellationToken,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: record.id,
            kind: record.kind.clone(),
            data: serde_json::from_value(record.payload.clone())?,
            priority: record.priority,
            attempt: record.attempt,
            max_attempts: record.max_attempts,
            enqueued_at: record.enqueued_at,
            cancellation,
        })
    }
}

impl<D> Job<D> {
    /// Whether a failure of this attempt will exhaust the job's retries.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt.saturating_add(1) >= self.max_attempts
    }

    /// Whether the soft time limit has elapsed and the job has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes once the soft time limit has elapsed.
    ///
    /// Long running jobs should race their work against this future and wind down when it
    /// resolves. Jobs still running at the hard time limit are aborted.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

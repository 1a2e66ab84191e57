use std::{fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{executor::KindDefaults, store::StoreError, worker::WorkerId};

use super::{JobId, Priority};

/// The lifecycle state of a job.
///
/// ```text
/// Queued -> Running -> Succeeded
///              |-----> Failed
///              `-----> Retrying -> Queued
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Retrying)
                | (Self::Retrying, Self::Queued)
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(state)
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Eligible for retry.
    TransientFailure,
    /// Never retried, regardless of the remaining attempts.
    PermanentFailure,
    /// The soft or hard time limit was exceeded.
    TimeoutFailure,
    /// A transient failure on the last permitted attempt.
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub attempt: u16,
    pub kind: ErrorKind,
    pub error_type: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// A snapshot of a job and its execution state, as written to the
/// [`crate::store::ResultStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub payload: Value,
    pub priority: Priority,
    pub attempt: u16,
    pub max_attempts: u16,
    pub base_delay: Duration,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub errors: Vec<JobError>,
    pub owner: Option<WorkerId>,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) fn new(
        kind: String,
        payload: Value,
        priority: Priority,
        max_attempts: u16,
        base_delay: Duration,
        defaults: &KindDefaults,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            payload,
            priority,
            attempt: 0,
            max_attempts,
            base_delay,
            soft_time_limit: defaults.soft_time_limit,
            hard_time_limit: defaults.hard_time_limit,
            state: JobState::Queued,
            result: None,
            error: None,
            errors: Vec::new(),
            owner: None,
            enqueued_at: now,
            scheduled_at: now,
            started_at: None,
            attempted_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: JobState) -> Result<(), StoreError> {
        if !self.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// A retrying job that has become ready passes through `Queued` on its way to `Running`.
    pub(crate) fn mark_running(
        &mut self,
        owner: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.state == JobState::Retrying {
            self.transition(JobState::Queued)?;
        }
        self.transition(JobState::Running)?;
        self.owner = Some(owner);
        self.started_at.get_or_insert(now);
        self.attempted_at = Some(now);
        Ok(())
    }

    pub(crate) fn mark_succeeded(
        &mut self,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(JobState::Succeeded)?;
        self.result = Some(result);
        self.error = None;
        self.owner = None;
        self.finished_at.get_or_insert(now);
        Ok(())
    }

    pub(crate) fn mark_retrying(
        &mut self,
        error: JobError,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.attempt.saturating_add(1) > self.max_attempts {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: JobState::Retrying,
            });
        }
        self.transition(JobState::Retrying)?;
        self.attempt += 1;
        self.errors.push(error);
        self.scheduled_at = scheduled_at;
        self.owner = None;
        Ok(())
    }

    /// Fails the job. When retries were exhausted the attempt counter is advanced to
    /// `max_attempts` to record the final failed attempt.
    pub(crate) fn mark_failed(
        &mut self,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(JobState::Failed)?;
        if error.kind == ErrorKind::RetriesExhausted {
            self.attempt = self.attempt.saturating_add(1).min(self.max_attempts);
        }
        self.errors.push(error.clone());
        self.error = Some(error);
        self.result = None;
        self.owner = None;
        self.finished_at.get_or_insert(now);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    impl JobRecord {
        pub(crate) const DEFAULT_KIND: &'static str = "kind";

        pub(crate) fn raw_job() -> Self {
            Self::new(
                Self::DEFAULT_KIND.to_owned(),
                json!("data"),
                Priority::Normal,
                3,
                Duration::from_millis(10),
                &KindDefaults::default(),
                Utc::now(),
            )
        }

        pub(crate) fn with_payload(self, payload: Value) -> Self {
            Self { payload, ..self }
        }

        pub(crate) fn with_max_attempts(self, max_attempts: u16) -> Self {
            Self {
                max_attempts,
                ..self
            }
        }

        pub(crate) fn with_state(self, state: JobState) -> Self {
            Self { state, ..self }
        }
    }

    pub(crate) fn job_error(kind: ErrorKind, attempt: u16) -> JobError {
        JobError {
            attempt,
            kind,
            error_type: "custom".to_owned(),
            message: "went wrong".to_owned(),
            recorded_at: Utc::now(),
        }
    }

    const ALL_STATES: [JobState; 5] = [
        JobState::Queued,
        JobState::Running,
        JobState::Retrying,
        JobState::Succeeded,
        JobState::Failed,
    ];

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in ALL_STATES.into_iter().filter(|state| state.is_terminal()) {
            for to in ALL_STATES {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn happy_path() {
        let mut record = JobRecord::raw_job();
        let now = Utc::now();

        record.mark_running(WorkerId::from(1), now).unwrap();
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.owner, Some(WorkerId::from(1)));
        assert_eq!(record.started_at, Some(now));

        record.mark_succeeded(json!("done"), now).unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.result, Some(json!("done")));
        assert_eq!(record.error, None);
        assert_eq!(record.owner, None);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.finished_at, Some(now));
    }

    #[test]
    fn retry_loop_keeps_first_started_at() {
        let mut record = JobRecord::raw_job();
        let first = Utc::now();
        let second = first + chrono::TimeDelta::seconds(5);

        record.mark_running(WorkerId::from(0), first).unwrap();
        record
            .mark_retrying(job_error(ErrorKind::TransientFailure, 0), second)
            .unwrap();
        assert_eq!(record.state, JobState::Retrying);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.scheduled_at, second);

        record.mark_running(WorkerId::from(1), second).unwrap();
        assert_eq!(record.started_at, Some(first));
        assert_eq!(record.attempted_at, Some(second));
        assert_eq!(record.errors.len(), 1);
    }

    #[test]
    fn exhausted_failure_advances_attempt_to_max() {
        let mut record = JobRecord::raw_job().with_max_attempts(1);
        let now = Utc::now();

        record.mark_running(WorkerId::from(0), now).unwrap();
        record
            .mark_failed(job_error(ErrorKind::RetriesExhausted, 0), now)
            .unwrap();

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempt, 1);
        assert_matches!(
            record.error,
            Some(JobError {
                kind: ErrorKind::RetriesExhausted,
                ..
            })
        );
    }

    #[test]
    fn permanent_failure_keeps_attempt() {
        let mut record = JobRecord::raw_job();
        let now = Utc::now();

        record.mark_running(WorkerId::from(0), now).unwrap();
        record
            .mark_failed(job_error(ErrorKind::PermanentFailure, 0), now)
            .unwrap();

        assert_eq!(record.attempt, 0);
        assert_eq!(record.result, None);
    }

    #[test]
    fn cannot_leave_terminal_state() {
        let mut record = JobRecord::raw_job().with_state(JobState::Succeeded);

        assert_matches!(
            record.mark_running(WorkerId::from(0), Utc::now()),
            Err(StoreError::InvalidTransition {
                from: JobState::Succeeded,
                to: JobState::Running,
                ..
            })
        );
        assert_matches!(
            record.mark_failed(job_error(ErrorKind::PermanentFailure, 0), Utc::now()),
            Err(StoreError::InvalidTransition { .. })
        );
        assert_eq!(record.state, JobState::Succeeded);
    }

    #[test]
    fn cannot_retry_past_max_attempts() {
        let mut record = JobRecord::raw_job()
            .with_max_attempts(1)
            .with_state(JobState::Running);
        record.attempt = 1;

        assert_matches!(
            record.mark_retrying(job_error(ErrorKind::TransientFailure, 1), Utc::now()),
            Err(StoreError::InvalidTransition { .. })
        );
        assert_eq!(record.attempt, 1);
    }

    #[test]
    fn snapshot_serializes_state_in_snake_case() {
        let record = JobRecord::raw_job();
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["state"], json!("queued"));
        assert_eq!(value["priority"], json!("normal"));
    }
}

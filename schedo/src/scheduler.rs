//! Recurring jobs.
//!
//! A [`PeriodicJob`] pairs a job kind with a [`Trigger`]. A single timer task owns every entry
//! and submits a fresh job each time an entry is due; it never runs job bodies itself.
//!
//! Interval triggers are measured from the previous *scheduled* fire time, so a slow enqueue
//! does not shift later fires. When fires are missed, because the process was stalled or was
//! not running at all, they are coalesced into a single fire.
//!
//! # Example
//!
//! ```
//! # use schedo::prelude::*;
//! # use std::{str::FromStr, time::Duration};
//! # struct HealthCheck;
//! # struct DailyReport;
//! # #[async_trait::async_trait]
//! # impl Executor for HealthCheck {
//! #     type Data = ();
//! #     type Output = ();
//! #     const NAME: &'static str = "check_system_health";
//! #     async fn execute(&self, _job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
//! #         Ok(())
//! #     }
//! # }
//! # #[async_trait::async_trait]
//! # impl Executor for DailyReport {
//! #     type Data = ();
//! #     type Output = ();
//! #     const NAME: &'static str = "process_daily_report";
//! #     async fn execute(&self, _job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
//! #         Ok(())
//! #     }
//! # }
//! let health = PeriodicJob::every::<HealthCheck>(Duration::from_secs(40))
//!     .with_priority(Priority::High);
//! let report = PeriodicJob::cron::<DailyReport>(
//!     cron::Schedule::from_str("0 0 2 * * *").unwrap(),
//! );
//! ```
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio::{
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::{Dispatcher, EnqueuableJob},
    executor::Executor,
    job::Priority,
    queue::deadline,
};

/// When a [`PeriodicJob`] fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// A fixed interval. The first fire is one interval after start.
    Every(Duration),
    /// Upcoming times of a cron schedule, in UTC.
    Cron(Box<Schedule>),
}

/// A recurring entry of the scheduler.
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    pub(crate) kind: String,
    pub(crate) trigger: Trigger,
    payload: Value,
    priority: Priority,
    last_fired_at: Option<DateTime<Utc>>,
}

impl PeriodicJob {
    pub fn new(kind: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            kind: kind.into(),
            trigger,
            payload: Value::Null,
            priority: Priority::Normal,
            last_fired_at: None,
        }
    }

    /// Fire a job of kind `E` every `interval`.
    pub fn every<E: Executor>(interval: Duration) -> Self {
        Self::new(E::NAME, Trigger::Every(interval))
    }

    /// Fire a job of kind `E` on the given cron schedule.
    pub fn cron<E: Executor>(schedule: Schedule) -> Self {
        Self::new(E::NAME, Trigger::Cron(Box::new(schedule)))
    }

    /// The payload of every submitted job. Defaults to `null`, which decodes as `()`.
    pub fn with_payload(self, payload: Value) -> Self {
        Self { payload, ..self }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    /// Seed the entry with the time it last fired, typically read back from durable storage
    /// after a restart.
    ///
    /// If at least one fire was missed since then, the entry fires once straight away and then
    /// continues on its original grid.
    pub fn with_last_fired_at(self, last_fired_at: DateTime<Utc>) -> Self {
        Self {
            last_fired_at: Some(last_fired_at),
            ..self
        }
    }
}

/// The first instant after `now` on the grid `scheduled + k * interval`, `k >= 1`.
fn next_after(scheduled: Instant, interval: Duration, now: Instant) -> Instant {
    let next = deadline(scheduled, interval);
    if next > now {
        return next;
    }
    let periods = now.duration_since(scheduled).as_nanos() / interval.as_nanos().max(1) + 1;
    let offset = interval
        .as_nanos()
        .saturating_mul(periods)
        .try_into()
        .map(Duration::from_nanos)
        .unwrap_or(Duration::MAX);
    deadline(scheduled, offset)
}

/// Map a wall clock time onto the runtime clock.
fn instant_at(at: DateTime<Utc>) -> Instant {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    deadline(Instant::now(), delay)
}

struct Entry {
    job: PeriodicJob,
    next: Option<Instant>,
    cron_due: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(job: PeriodicJob) -> Self {
        let now = Instant::now();
        let (next, cron_due) = match &job.trigger {
            Trigger::Every(interval) => {
                let next = match job.last_fired_at {
                    None => deadline(now, *interval),
                    Some(last) => {
                        let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
                        if elapsed >= *interval {
                            // Overdue: fire now, anchored to the old grid.
                            let phase = Duration::from_nanos(
                                (elapsed.as_nanos() % interval.as_nanos().max(1)) as u64,
                            );
                            now.checked_sub(phase).unwrap_or(now)
                        } else {
                            deadline(now, *interval - elapsed)
                        }
                    }
                };
                (Some(next), None)
            }
            Trigger::Cron(schedule) => {
                let after = job.last_fired_at.unwrap_or_else(Utc::now);
                let due = schedule.after(&after).next();
                (due.map(instant_at), due)
            }
        };
        Self {
            job,
            next,
            cron_due,
        }
    }

    fn advance(&mut self) {
        match &self.job.trigger {
            Trigger::Every(interval) => {
                self.next = self
                    .next
                    .map(|scheduled| next_after(scheduled, *interval, Instant::now()));
            }
            Trigger::Cron(schedule) => {
                let from = self
                    .cron_due
                    .map_or_else(Utc::now, |due| due.max(Utc::now()));
                self.cron_due = schedule.after(&from).next();
                self.next = self.cron_due.map(instant_at);
            }
        }
    }
}

pub(crate) struct Scheduler {
    dispatcher: Dispatcher,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub(crate) fn new(dispatcher: Dispatcher, jobs: Vec<PeriodicJob>) -> Self {
        Self {
            dispatcher,
            entries: jobs.into_iter().map(Entry::new).collect(),
        }
    }

    pub(crate) fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.entries.iter().filter_map(|entry| entry.next).min() else {
                    tracing::debug!("No periodic jobs left to schedule");
                    break;
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = sleep_until(next) => self.fire_due().await,
                }
            }
            tracing::debug!("Shutting down the scheduler");
        })
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        let dispatcher = &self.dispatcher;
        for entry in self
            .entries
            .iter_mut()
            .filter(|entry| entry.next.is_some_and(|next| next <= now))
        {
            let kind = entry.job.kind.clone();
            let job = EnqueuableJob {
                priority: Some(entry.job.priority),
                ..EnqueuableJob::new(kind.clone(), entry.job.payload.clone())
            };
            match dispatcher.enqueue(job).await {
                Ok(job_id) => tracing::debug!(%job_id, "Fired periodic job {kind}"),
                Err(err) => {
                    tracing::error!(?err, "Failed to enqueue periodic job {kind} with {err}")
                }
            }

            entry.advance();
            if entry.next.is_none() {
                tracing::warn!("Periodic job {kind} has no upcoming fire times");
            }
        }
        self.entries.retain(|entry| entry.next.is_some());
    }
}

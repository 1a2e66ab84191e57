//! The retry policy consulted by the worker pool when a job body fails.
//!
//! Given the attempt that just failed, the job's `max_attempts` and `base_delay`, and the kind
//! of failure, [`RetryPolicy::evaluate`] decides whether to retry and how long to wait first.
//!
//! The delay grows exponentially, `base_delay * 2^attempt`, where `attempt` is the zero based
//! index of the failed attempt. The first retry therefore waits `base_delay`.
//!
//! # Example
//!
//! ```
//! # use schedo::prelude::*;
//! # use schedo::job::ErrorKind;
//! # use std::time::Duration;
//! let policy = RetryPolicy::new();
//! let base_delay = Duration::from_secs(2);
//!
//! assert_eq!(
//!     policy.evaluate(0, 3, base_delay, ErrorKind::TransientFailure),
//!     RetryDecision::Retry { after: Duration::from_secs(2) }
//! );
//! assert_eq!(
//!     policy.evaluate(1, 3, base_delay, ErrorKind::TransientFailure),
//!     RetryDecision::Retry { after: Duration::from_secs(4) }
//! );
//! assert_eq!(
//!     policy.evaluate(2, 3, base_delay, ErrorKind::TransientFailure),
//!     RetryDecision::GiveUp
//! );
//! assert_eq!(
//!     policy.evaluate(0, 3, base_delay, ErrorKind::PermanentFailure),
//!     RetryDecision::GiveUp
//! );
//! ```

use std::time::Duration;

use rand::Rng;

use crate::job::ErrorKind;

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Outcome of [`RetryPolicy::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(Duration),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: Duration) -> Duration {
        let milliseconds = match self {
            Self::Absolute(delta) => i64::try_from(delta.as_millis()).unwrap_or(i64::MAX),
            Self::Relative(ratio) => (value.as_millis() as f64 * ratio).round() as i64,
        };
        let milliseconds = milliseconds.abs();
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        if jitter.is_negative() {
            value.saturating_sub(Duration::from_millis(jitter.unsigned_abs()))
        } else {
            value.saturating_add(Duration::from_millis(jitter as u64))
        }
    }
}

/// Exponential backoff with an upper bound and optional jitter.
///
/// All of the constructors and configuration functions are `const`. Without a jitter the
/// policy is deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_delay: Duration,
    jitter: Option<Jitter>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    /// Exponential backoff without jitter, capped at seven days.
    pub const fn new() -> Self {
        Self {
            max_delay: DEFAULT_MAX_DELAY,
            jitter: None,
        }
    }

    /// Clamps the delay returned by [`RetryPolicy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Add a jitter to the delay, see [`Jitter`].
    ///
    /// Note that a jittered policy no longer guarantees that successive delays are
    /// non-decreasing.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The delay before retrying after the zero based `attempt` failed.
    pub fn backoff(&self, base_delay: Duration, attempt: u16) -> Duration {
        let delay = 2u32
            .checked_pow(attempt.into())
            .and_then(|factor| base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
            .min(self.max_delay);

        match self.jitter {
            Some(jitter) => jitter.apply_jitter(delay),
            None => delay,
        }
    }

    /// Decide what to do after the zero based `attempt` failed with a failure of `kind`.
    ///
    /// Permanent failures and timeouts are never retried. A transient failure is retried
    /// while another attempt is permitted, `attempt + 1 < max_attempts`.
    pub fn evaluate(
        &self,
        attempt: u16,
        max_attempts: u16,
        base_delay: Duration,
        kind: ErrorKind,
    ) -> RetryDecision {
        match kind {
            ErrorKind::PermanentFailure | ErrorKind::TimeoutFailure => RetryDecision::GiveUp,
            ErrorKind::TransientFailure | ErrorKind::RetriesExhausted
                if attempt.saturating_add(1) >= max_attempts =>
            {
                RetryDecision::GiveUp
            }
            ErrorKind::TransientFailure | ErrorKind::RetriesExhausted => RetryDecision::Retry {
                after: self.backoff(base_delay, attempt),
            },
        }
    }
}

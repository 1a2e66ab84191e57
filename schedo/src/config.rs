//! Runtime configuration of a [`crate::Schedo`] instance.
//!
//! Every setting has a default; [`Config::from_env`] overrides them from the process
//! environment:
//!
//! | variable                       | setting                              | default |
//! |--------------------------------|--------------------------------------|---------|
//! | `SCHEDO_WORKER_CONCURRENCY`    | [`Config::with_concurrency`]         | 4       |
//! | `SCHEDO_FAIRNESS_EVERY`        | [`Config::with_fairness`]            | 5       |
//! | `SCHEDO_HEARTBEAT_INTERVAL_MS` | [`Config::with_heartbeat_interval`]  | 5000    |
//! | `SCHEDO_REAP_INTERVAL_MS`      | [`Config::with_reap_interval`]       | 10000   |
//!
//! `SCHEDO_FAIRNESS_EVERY=0` selects [`Fairness::Strict`]; any other value must be at least
//! [`MIN_FAIRNESS_EVERY`].
use std::{num::ParseIntError, time::Duration};

use thiserror::Error;

use crate::{backoff::RetryPolicy, queue::Fairness};

const WORKER_CONCURRENCY: &str = "SCHEDO_WORKER_CONCURRENCY";
const FAIRNESS_EVERY: &str = "SCHEDO_FAIRNESS_EVERY";
const HEARTBEAT_INTERVAL_MS: &str = "SCHEDO_HEARTBEAT_INTERVAL_MS";
const REAP_INTERVAL_MS: &str = "SCHEDO_REAP_INTERVAL_MS";

/// The smallest accepted `Fairness::Floor::every`.
pub const MIN_FAIRNESS_EVERY: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {source}")]
    Parse {
        key: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("Worker concurrency must be at least 1")]
    Concurrency,
    #[error(
        "A fairness floor must serve the normal class at most once every {min} dequeues, got {0}",
        min = MIN_FAIRNESS_EVERY
    )]
    Fairness(u32),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub(crate) concurrency: usize,
    pub(crate) fairness: Fairness,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) reap_interval: Duration,
    pub(crate) claim_timeout: Duration,
    pub(crate) retry_policy: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            concurrency: 4,
            fairness: Fairness::Floor { every: 5 },
            heartbeat_interval: Duration::from_secs(5),
            reap_interval: Duration::from_secs(10),
            claim_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::new(),
        }
    }

    /// The number of workers, and therefore the number of jobs run at once.
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub const fn with_fairness(mut self, fairness: Fairness) -> Self {
        self.fairness = fairness;
        self
    }

    /// How often a running job refreshes its lease.
    ///
    /// Must be comfortably shorter than the smallest hard time limit of any registered kind,
    /// otherwise live jobs are reclaimed as orphans.
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How often the lease table is scanned for orphaned jobs.
    pub const fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// How long a dequeued job may go unclaimed before the reaper puts it back.
    pub const fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub const fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// The defaults overridden by any `SCHEDO_*` variables in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(key)
                .map(|value| {
                    value.trim().parse().map_err(|source| ConfigError::Parse {
                        key,
                        value,
                        source,
                    })
                })
                .transpose()
        };

        let mut config = Self::new();
        if let Some(concurrency) = parse(WORKER_CONCURRENCY)? {
            config.concurrency = concurrency as usize;
        }
        if let Some(every) = parse(FAIRNESS_EVERY)? {
            config.fairness = match every {
                0 => Fairness::Strict,
                every => Fairness::Floor {
                    every: every.try_into().unwrap_or(u32::MAX),
                },
            };
        }
        if let Some(millis) = parse(HEARTBEAT_INTERVAL_MS)? {
            config.heartbeat_interval = Duration::from_millis(millis);
        }
        if let Some(millis) = parse(REAP_INTERVAL_MS)? {
            config.reap_interval = Duration::from_millis(millis);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Concurrency);
        }
        if let Fairness::Floor { every } = self.fairness {
            if every < MIN_FAIRNESS_EVERY {
                return Err(ConfigError::Fairness(every));
            }
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("heartbeat interval"));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("reap interval"));
        }
        if self.claim_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("claim timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use fxhash::FxHashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: FxHashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.fairness, Fairness::Floor { every: 5 });
    }

    #[test]
    fn environment_overrides() {
        let config = Config::from_lookup(lookup(&[
            (WORKER_CONCURRENCY, "16"),
            (FAIRNESS_EVERY, "8"),
            (HEARTBEAT_INTERVAL_MS, " 250 "),
            (REAP_INTERVAL_MS, "1000"),
        ]))
        .unwrap();

        assert_eq!(config.concurrency, 16);
        assert_eq!(config.fairness, Fairness::Floor { every: 8 });
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.reap_interval, Duration::from_secs(1));
    }

    #[test]
    fn zero_fairness_is_strict() {
        let config = Config::from_lookup(lookup(&[(FAIRNESS_EVERY, "0")])).unwrap();

        assert_eq!(config.fairness, Fairness::Strict);
    }

    #[test]
    fn unparsable_value() {
        assert_matches!(
            Config::from_lookup(lookup(&[(WORKER_CONCURRENCY, "many")])),
            Err(ConfigError::Parse { key: WORKER_CONCURRENCY, value, .. }) if value == "many"
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(
            Config::from_lookup(lookup(&[(WORKER_CONCURRENCY, "0")])),
            Err(ConfigError::Concurrency)
        );
        for every in 1..MIN_FAIRNESS_EVERY {
            let value = every.to_string();
            assert_matches!(
                Config::from_lookup(lookup(&[(FAIRNESS_EVERY, value.as_str())])),
                Err(ConfigError::Fairness(rejected)) if rejected == every
            );
            assert_matches!(
                Config::new()
                    .with_fairness(Fairness::Floor { every })
                    .validate(),
                Err(ConfigError::Fairness(rejected)) if rejected == every
            );
        }
        assert_matches!(
            Config::new()
                .with_fairness(Fairness::Floor { every: MIN_FAIRNESS_EVERY })
                .validate(),
            Ok(())
        );
        assert_matches!(
            Config::new()
                .with_heartbeat_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroInterval(_))
        );
    }
}

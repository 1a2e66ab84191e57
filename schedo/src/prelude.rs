//! The purpose of this module is to alleviate the need to import many of the `[schedo]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use schedo::prelude::*;
//! ```
pub use crate::backoff::{Jitter, RetryDecision, RetryPolicy};
pub use crate::config::Config;
pub use crate::dispatcher::Dispatcher;
pub use crate::executor::{ExecutionError, ExecutionResult, Executor, Failure};
pub use crate::job::{Job, JobId, JobRecord, JobState, Priority};
pub use crate::queue::Fairness;
pub use crate::scheduler::{PeriodicJob, Trigger};
pub use crate::store::ResultStore;
pub use crate::{Running, Schedo, SchedoError};

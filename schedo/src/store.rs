//! The result store records every job state transition and serves the read path used for
//! polling.
//!
//! Durable stores live outside this crate; implement [`ResultStore`] for them.
//! [`memory::InMemoryResultStore`] is provided for tests and single process deployments.
use async_trait::async_trait;
use thiserror::Error;

use crate::job::{JobId, JobRecord, JobState};

pub mod memory;

/// Key-value access to job snapshots, keyed by [`JobId`].
///
/// Writes must be visible to subsequent reads; the dispatcher never caches snapshots.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or overwrite the snapshot for `record.id`.
    async fn put(&self, record: JobRecord) -> Result<(), StoreError>;
    /// The latest snapshot for `id`, if any.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("System in bad state")]
    BadState,
    #[error("Invalid transition for {id} from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("Result store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    mockall::mock! {
        pub Store {}

        #[async_trait]
        impl ResultStore for Store {
            async fn put(&self, record: JobRecord) -> Result<(), StoreError>;
            async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;
        }
    }
}

//! Provides an in memory implementation of [`ResultStore`].
//!
//! Snapshots live for as long as the process does; there is no retention policy.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use fxhash::FxHashMap;

use crate::job::{JobId, JobRecord, JobState};

use super::{ResultStore, StoreError};

/// An in memory implementation of [`ResultStore`].
///
/// Cloning is cheap and clones share the same underlying map.
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    records: Arc<RwLock<FxHashMap<JobId, JobRecord>>>,
}

impl InMemoryResultStore {
    /// Creates a new instance of [`InMemoryResultStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored snapshots.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().map_err(|_| StoreError::BadState)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// All stored snapshots in the given state.
    pub fn in_state(&self, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|record| record.state == state)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::BadState)?
            .insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().map_err(|_| StoreError::BadState)?.get(&id).cloned())
    }
}

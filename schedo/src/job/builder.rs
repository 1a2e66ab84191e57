use std::{marker::PhantomData, time::Duration};

use crate::{
    dispatcher::{Dispatcher, EnqueuableJob},
    executor::Executor,
    SchedoError,
};

use super::{JobId, Priority};

/// Typed construction of a job for the executor `E`.
///
/// Obtained from [`Executor::builder`]. Anything left unset falls back to the executor's
/// associated constants.
///
/// ```
/// # use schedo::prelude::*;
/// # use std::time::Duration;
/// # struct ProcessData;
/// # #[async_trait::async_trait]
/// # impl Executor for ProcessData {
/// #     type Data = String;
/// #     type Output = String;
/// #     const NAME: &'static str = "process_data";
/// #     async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
/// #         Ok(job.data)
/// #     }
/// # }
/// # async fn submit(dispatcher: &Dispatcher) -> Result<JobId, SchedoError> {
/// ProcessData::builder()
///     .with_data("rows.csv".to_owned())
///     .with_priority(Priority::High)
///     .with_max_attempts(5)
///     .with_base_delay(Duration::from_secs(60))
///     .enqueue(dispatcher)
///     .await
/// # }
/// ```
pub struct JobBuilder<E>
where
    E: Executor,
{
    data: Option<E::Data>,
    priority: Option<Priority>,
    max_attempts: Option<u16>,
    base_delay: Option<Duration>,
    _executor: PhantomData<E>,
}

impl<E> Default for JobBuilder<E>
where
    E: Executor,
{
    fn default() -> Self {
        Self {
            data: None,
            priority: None,
            max_attempts: None,
            base_delay: None,
            _executor: PhantomData,
        }
    }
}

impl<E> JobBuilder<E>
where
    E: Executor,
{
    pub fn with_data(self, data: E::Data) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub fn with_base_delay(self, base_delay: Duration) -> Self {
        Self {
            base_delay: Some(base_delay),
            ..self
        }
    }

    pub async fn enqueue(self, dispatcher: &Dispatcher) -> Result<JobId, SchedoError> {
        let payload = serde_json::to_value(self.data)?;
        dispatcher
            .enqueue(EnqueuableJob {
                priority: self.priority,
                max_attempts: self.max_attempts,
                base_delay: self.base_delay,
                ..EnqueuableJob::new(E::NAME, payload)
            })
            .await
    }
}

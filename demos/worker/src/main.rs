use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use schedo::{prelude::*, store::memory::InMemoryResultStore};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_DATA_IDS: [&str; 3] = ["1", "7", "10"];

// `MAX_ATTEMPTS` counts executions: a kind allowed 3 retries runs at most 4 times.

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let running = Schedo::new(config, InMemoryResultStore::new())
        .with_executor(ProcessData)
        .with_executor(ProcessHighPriorityData)
        .with_executor(ProcessDailyReport)
        .with_executor(ProcessHourlyData)
        .with_executor(CheckSystemHealth)
        .with_periodic(PeriodicJob::every::<ProcessDailyReport>(Duration::from_secs(86400)))
        .with_periodic(PeriodicJob::every::<ProcessHourlyData>(Duration::from_secs(3600)))
        .with_periodic(PeriodicJob::every::<CheckSystemHealth>(Duration::from_secs(40)))
        .start()?;

    let mut data_ids: Vec<String> = std::env::args().skip(1).collect();
    if data_ids.is_empty() {
        data_ids = DEFAULT_DATA_IDS.map(ToOwned::to_owned).to_vec();
    }

    let mut job_ids = Vec::with_capacity(data_ids.len() + 1);
    for data_id in data_ids {
        let job_id = ProcessData::builder()
            .with_data(data_id.clone())
            .enqueue(running.dispatcher())
            .await?;
        tracing::info!(%job_id, "Data processing job {job_id} created for data_id {data_id}");
        job_ids.push(job_id);
    }
    let job_id = ProcessHighPriorityData::builder()
        .with_data("urgent".to_owned())
        .enqueue(running.dispatcher())
        .await?;
    tracing::info!(%job_id, "High priority job {job_id} created");
    job_ids.push(job_id);

    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                for job_id in &job_ids {
                    let record = running.dispatcher().get_state(*job_id).await?;
                    tracing::info!(
                        %job_id,
                        state = %record.state,
                        attempt = record.attempt,
                        result = ?record.result,
                        error = ?record.error.as_ref().map(|error| &error.message),
                        "Job {job_id} of kind {} is {}",
                        record.kind,
                        record.state,
                    );
                }
            }
        }
    }

    tracing::info!("Shutting down");
    running.graceful_shutdown().await?;
    Ok(())
}

#[derive(Debug, Error)]
enum TaskError {
    #[error("Data processing failed for data_id: {0}")]
    Rejected(String),
    #[error("data_id must be numeric, got {0:?}")]
    InvalidId(String),
    #[error("Interrupted by the soft time limit")]
    Interrupted,
}

impl ExecutionError for TaskError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::InvalidId(_) => "invalid_id",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Stands in for real work, giving up early once asked to stop.
async fn simulate_work<D>(job: &Job<D>, duration: Duration) -> Result<(), TaskError> {
    tokio::select! {
        _ = job.cancelled() => Err(TaskError::Interrupted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[derive(Debug, Serialize)]
struct Processed {
    id: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct Status {
    message: &'static str,
    timestamp: Option<u64>,
}

struct ProcessData;

#[async_trait]
impl Executor for ProcessData {
    type Data = String;
    type Output = Processed;
    const NAME: &'static str = "process_data";
    const MAX_ATTEMPTS: u16 = 4;
    const BASE_DELAY: Duration = Duration::from_secs(15);

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
        tracing::info!("Processing data with id: {}", job.data);
        simulate_work(&job, Duration::from_secs(5)).await?;

        let numeric: u64 = job
            .data
            .parse()
            .map_err(|_| Failure::permanent(TaskError::InvalidId(job.data.clone())))?;
        if numeric % 10 == 0 {
            return Err(TaskError::Rejected(job.data).into());
        }

        Ok(Processed {
            message: format!("Data processed successfully for data_id: {}", job.data),
            id: job.data,
        })
    }
}

struct ProcessHighPriorityData;

#[async_trait]
impl Executor for ProcessHighPriorityData {
    type Data = String;
    type Output = Processed;
    const NAME: &'static str = "process_high_priority_data";
    const MAX_ATTEMPTS: u16 = 6;
    const BASE_DELAY: Duration = Duration::from_secs(60);
    const PRIORITY: Priority = Priority::High;

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
        tracing::info!("Processing high priority task with id: {}", job.data);
        simulate_work(&job, Duration::from_secs(3)).await?;

        Ok(Processed {
            message: format!(
                "High priority task processed successfully for task_id: {}",
                job.data
            ),
            id: job.data,
        })
    }
}

struct ProcessDailyReport;

#[async_trait]
impl Executor for ProcessDailyReport {
    type Data = ();
    type Output = Status;
    const NAME: &'static str = "process_daily_report";
    const MAX_ATTEMPTS: u16 = 4;
    const BASE_DELAY: Duration = Duration::from_secs(300);

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
        tracing::info!("Processing daily report");
        simulate_work(&job, Duration::from_secs(10)).await?;
        Ok(Status {
            message: "Daily report generated successfully",
            timestamp: None,
        })
    }
}

struct ProcessHourlyData;

#[async_trait]
impl Executor for ProcessHourlyData {
    type Data = ();
    type Output = Status;
    const NAME: &'static str = "process_hourly_data";
    const MAX_ATTEMPTS: u16 = 4;
    const BASE_DELAY: Duration = Duration::from_secs(120);

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
        tracing::info!("Processing hourly data");
        simulate_work(&job, Duration::from_secs(8)).await?;
        Ok(Status {
            message: "Hourly data processed successfully",
            timestamp: None,
        })
    }
}

struct CheckSystemHealth;

#[async_trait]
impl Executor for CheckSystemHealth {
    type Data = ();
    type Output = Status;
    const NAME: &'static str = "check_system_health";
    const MAX_ATTEMPTS: u16 = 6;
    const BASE_DELAY: Duration = Duration::from_secs(30);

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
        tracing::info!("Checking system health");
        simulate_work(&job, Duration::from_secs(3)).await?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .ok();
        Ok(Status {
            message: "System is healthy",
            timestamp,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attempts_cover_the_first_run_and_every_retry() {
        assert_eq!(ProcessData::MAX_ATTEMPTS, 3 + 1);
        assert_eq!(ProcessHighPriorityData::MAX_ATTEMPTS, 5 + 1);
        assert_eq!(ProcessDailyReport::MAX_ATTEMPTS, 3 + 1);
        assert_eq!(ProcessHourlyData::MAX_ATTEMPTS, 3 + 1);
        assert_eq!(CheckSystemHealth::MAX_ATTEMPTS, 5 + 1);
    }
}

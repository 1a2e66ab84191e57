//! Detects jobs whose worker has gone silent and hands them back to the retry path.
use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;

pub(crate) struct Reaper {
    dispatcher: Dispatcher,
    interval: Duration,
}

impl Reaper {
    pub(crate) fn new(dispatcher: Dispatcher, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    pub(crate) fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.reap().await;
                    }
                }
            }
            tracing::debug!("Shutting down the reaper");
        })
    }

    /// Reclaim every orphaned lease, returning how many were found.
    pub(crate) async fn reap(&self) -> usize {
        let orphans = self.dispatcher.queue().orphaned(Instant::now());
        for (job_id, owner) in &orphans {
            tracing::warn!(%job_id, %owner, "Reclaiming job {job_id} from unresponsive {owner}");
            let _ = self
                .dispatcher
                .reclaim(*job_id, *owner)
                .await
                .inspect_err(|err| {
                    tracing::error!(?err, %job_id, "Failed to reclaim job {job_id}, error: {err}")
                });
        }
        orphans.len()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::{
        dispatcher::test::dispatcher_with,
        job::{ErrorKind, JobState, Priority},
        store::memory::InMemoryResultStore,
        worker::WorkerId,
    };

    const OWNER: WorkerId = WorkerId::new(0);

    async fn abandon(dispatcher: &Dispatcher, max_attempts: u16) -> crate::job::JobId {
        let job_id = dispatcher
            .submit("echo", json!(null), Priority::Normal, max_attempts, Duration::ZERO)
            .await
            .unwrap();
        let dequeued = dispatcher
            .queue()
            .dequeue_blocking(OWNER, &CancellationToken::new())
            .await
            .unwrap();
        dispatcher.claim(dequeued, OWNER).await.unwrap().unwrap();
        job_id
    }

    #[tokio::test(start_paused = true)]
    async fn live_leases_are_left_alone() {
        let dispatcher = dispatcher_with(InMemoryResultStore::new());
        let reaper = Reaper::new(dispatcher.clone(), Duration::from_millis(100));
        let job_id = abandon(&dispatcher, 3).await;

        tokio::time::advance(Duration::from_millis(900)).await;

        assert_eq!(reaper.reap().await, 0);
        assert_eq!(dispatcher.get_state(job_id).await.unwrap().state, JobState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_job_is_requeued_exactly_once() {
        let dispatcher = dispatcher_with(InMemoryResultStore::new());
        let reaper = Reaper::new(dispatcher.clone(), Duration::from_millis(100));
        let job_id = abandon(&dispatcher, 3).await;

        // The echo kind has a one second hard time limit.
        tokio::time::advance(Duration::from_millis(1100)).await;

        assert_eq!(reaper.reap().await, 1);
        assert_eq!(reaper.reap().await, 0);

        let record = dispatcher.get_state(job_id).await.unwrap();
        assert_eq!(record.state, JobState::Retrying);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.owner, None);
        assert_eq!(dispatcher.queue().in_flight(), 0);
        assert_eq!(dispatcher.queue().len(Priority::Normal), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_job_on_its_last_attempt_fails() {
        let dispatcher = dispatcher_with(InMemoryResultStore::new());
        let reaper = Reaper::new(dispatcher.clone(), Duration::from_millis(100));
        let job_id = abandon(&dispatcher, 1).await;

        tokio::time::advance(Duration::from_millis(1100)).await;
        reaper.reap().await;

        let record = dispatcher.get_state(job_id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.error.unwrap().kind, ErrorKind::RetriesExhausted);
        assert!(dispatcher.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_stops_on_shutdown() {
        let dispatcher = dispatcher_with(InMemoryResultStore::new());
        let shutdown = CancellationToken::new();
        let handle = Reaper::new(dispatcher.clone(), Duration::from_millis(100)).spawn(shutdown.clone());
        let job_id = abandon(&dispatcher, 3).await;

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(dispatcher.get_state(job_id).await.unwrap().state, JobState::Retrying);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

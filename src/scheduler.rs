//! Periodic background jobs.
//!
//! Each job runs on its own task.  A run always completes before the next
//! wait starts, so a job never overlaps itself; a slow run simply pushes the
//! next one back.  Errors are logged and the loop carries on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> anyhow::Result<()>;
}

/// When the first run happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    Now,
    AfterInterval,
}

/// Run `job` every `interval` until `cancel` fires.
pub async fn run_periodic(
    job: Arc<dyn Job>,
    interval: Duration,
    start: Start,
    cancel: CancellationToken,
) {
    info!(job = job.name(), interval_secs = interval.as_secs(), "starting job");

    if start == Start::AfterInterval && !wait(interval, &cancel).await {
        info!(job = job.name(), "job stopped");
        return;
    }

    loop {
        debug!(job = job.name(), "running job");
        if let Err(e) = job.run_once().await {
            error!(job = job.name(), error = %format!("{e:#}"), "job run failed");
        }

        if !wait(interval, &cancel).await {
            break;
        }
    }

    info!(job = job.name(), "job stopped");
}

/// Sleep for `interval`.  Returns `false` if cancelled first.
async fn wait(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(interval) => true,
        () = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        work: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self) -> anyhow::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail, "boom");
            Ok(())
        }
    }

    fn spawn(
        job: &Arc<CountingJob>,
        interval: Duration,
        start: Start,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_periodic(
            Arc::clone(job) as Arc<dyn Job>,
            interval,
            start,
            cancel.clone(),
        ));
        (cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_every_interval() {
        let job = Arc::new(CountingJob::default());
        let (cancel, handle) = spawn(&job, Duration::from_secs(100), Start::Now);

        tokio::time::sleep(Duration::from_secs(250)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_start_waits_one_interval() {
        let job = Arc::new(CountingJob::default());
        let (cancel, handle) = spawn(&job, Duration::from_secs(100), Start::AfterInterval);

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let job = Arc::new(CountingJob {
            fail: true,
            ..Default::default()
        });
        let (cancel, handle) = spawn(&job, Duration::from_secs(10), Start::Now);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_runs_never_overlap() {
        let job = Arc::new(CountingJob {
            work: Duration::from_secs(150),
            ..Default::default()
        });
        let (cancel, handle) = spawn(&job, Duration::from_secs(100), Start::Now);

        // runs finish at 150, 400, 650
        tokio::time::sleep(Duration::from_secs(700)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        assert_eq!(job.max_in_flight.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_first_run() {
        let job = Arc::new(CountingJob::default());
        let (cancel, handle) = spawn(&job, Duration::from_secs(100), Start::AfterInterval);
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }
}

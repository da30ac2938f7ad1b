use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A unit of recurring work. Each tick runs to completion before the next
/// one is scheduled.
#[async_trait]
pub trait Job: Send + 'static {
    async fn tick(&mut self);
}

/// Fixed-period background task with an explicit stop signal.
pub struct RecurringTask {
    name: String,
    period: Duration,
    cancel: CancellationToken,
}

impl RecurringTask {
    pub fn new(name: impl Into<String>, period: Duration, cancel: CancellationToken) -> Self {
        Self {
            name: name.into(),
            period,
            cancel,
        }
    }

    /// Spawn the job on the runtime. The returned handle resolves once the
    /// token is cancelled.
    pub fn spawn<J: Job>(self, job: J) -> JoinHandle<()> {
        tokio::spawn(self.run(job))
    }

    async fn run<J: Job>(self, mut job: J) {
        let mut interval = tokio::time::interval(self.period);
        // A slow tick pushes the schedule back instead of bursting to catch up.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Scheduled task '{}' every {:?}", self.name, self.period);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = job.tick() => {}
            }
        }

        info!("Scheduled task '{}' stopped", self.name);
    }
}

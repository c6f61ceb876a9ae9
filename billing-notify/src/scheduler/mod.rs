//! Periodic background jobs.
//!
//! Every job is an explicit ticker loop started by the service container and
//! stopped through its cancellation token. A failed cycle is logged and the
//! next tick runs as usual.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// One cycle. Returns how many items the cycle handled.
    async fn run_once(&self) -> Result<usize>;
}

/// Run `job` every `period` until `cancel` fires.
pub fn spawn_periodic(
    job: Arc<dyn PeriodicJob>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = job.name();
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job = name, period_ms = period.as_millis() as u64, "Periodic job started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match job.run_once().await {
                        Ok(0) => {}
                        Ok(handled) => debug!(job = name, handled, "Job cycle completed"),
                        Err(e) => error!(job = name, "Job cycle failed: {}", e),
                    }
                }
            }
        }
        info!(job = name, "Periodic job stopped");
    })
}

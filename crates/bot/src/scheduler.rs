use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One fixed-cadence background job. The pacer only emits ticks into `tick`;
/// the owning worker drains the channel and does the actual work, so a slow
/// pass never stacks up behind the timer (missed ticks are skipped, not
/// replayed).
pub struct TickJob {
    pub name: &'static str,
    pub every: Duration,
    pub tick: mpsc::Sender<()>,
    /// Fire once right away instead of waiting out the first interval.
    pub immediate: bool,
}

/// Spawn one pacer task per job. A pacer stops when the shutdown token fires
/// or when its worker hangs up the receiving end.
pub fn spawn_pacers(jobs: Vec<TickJob>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let first_at = if job.immediate {
                    Instant::now()
                } else {
                    Instant::now() + job.every
                };
                let mut timer = tokio::time::interval_at(first_at, job.every);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {}
                    }
                    tracing::debug!(job = job.name, "pacer tick");
                    if job.tick.send(()).await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect()
}

//! Fixed-interval background tasks.
//!
//! Every periodic cycle runs on its own task and timer, so a slow cycle never
//! delays another one. A cycle that overruns its interval makes the timer
//! skip the missed ticks instead of queueing them.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Run `tick` every `period` until `shutdown` changes. The first tick fires
/// immediately.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(task = name, "Periodic task stopped");
    })
}

//! # Periodic Tasks
//!
//! Cancellable fixed-interval task. The first tick fires immediately; a tick
//! that overruns the interval delays the next one instead of bursting.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn `tick` every `interval` until `token` is cancelled
///
/// Cancellation is observed both while waiting for the next tick and while a
/// tick is running, so a stopped task never starts another pass and abandons
/// the one in flight.
pub fn spawn_periodic<F, Fut>(
    name: impl Into<String>,
    interval: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = %name, interval_secs = interval.as_secs_f64(), "Periodic task started");

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tick() => {}
            }
        }

        info!(task = %name, "Periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate_then_fixed_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let counter = Arc::clone(&count);
        let handle = spawn_periodic("test", Duration::from_secs(10), token.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_running_tick() {
        let token = CancellationToken::new();
        let handle = spawn_periodic("slow", Duration::from_secs(1), token.clone(), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop promptly")
            .unwrap();
    }
}

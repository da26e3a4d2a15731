use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub type TimerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs each registered timer on its own tokio task.
///
/// A timer waits its interval, fires, and waits again until the shared stop
/// signal is raised. A firing is never interrupted; the stop signal is only
/// observed while waiting, so a slow callback delays nothing but its own
/// next tick.
pub struct TimerScheduler {
    stop: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start a periodic task. Registering the same name twice starts two
    /// independent tasks.
    pub async fn add_timer<F>(&self, name: &str, interval: Duration, task: F)
    where
        F: Fn() -> TimerFuture + Send + Sync + 'static,
    {
        let timer_name = name.to_string();
        let stop = self.stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                debug!("Running timer: {}", timer_name);
                match AssertUnwindSafe(task()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Timer '{}' failed: {:#}", timer_name, e),
                    Err(panic) => {
                        error!("Timer '{}' panicked: {}", timer_name, panic_message(&*panic));
                    }
                }
            }
            debug!("Timer '{}' stopped", timer_name);
        });

        let mut handles = self.handles.lock().await;
        handles.push(handle);
        info!(
            "Scheduled timer '{}' every {:?} ({} running)",
            name,
            interval,
            handles.len()
        );
    }

    pub async fn timer_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Raise the stop signal without waiting for the timers.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the stop signal is raised.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Stop all timers and wait for in-flight callbacks to finish.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let count = handles.len();
        futures::future::join_all(handles).await;
        info!("Scheduler stopped ({} timer(s))", count);
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() -> TimerFuture + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || -> TimerFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_every_interval() {
        let scheduler = TimerScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_timer("t1", Duration::from_secs(5), counting(&count))
            .await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_timer_does_not_delay_others() {
        let scheduler = TimerScheduler::new();
        let slow = Arc::new(AtomicUsize::new(0));
        let fast = Arc::new(AtomicUsize::new(0));

        let slow_counter = Arc::clone(&slow);
        scheduler
            .add_timer("slow", Duration::from_secs(1), move || -> TimerFuture {
                let slow = Arc::clone(&slow_counter);
                Box::pin(async move {
                    slow.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(100)).await;
                    Ok(())
                })
            })
            .await;
        scheduler
            .add_timer("fast", Duration::from_secs(5), counting(&fast))
            .await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(slow.load(Ordering::SeqCst), 1);
        assert_eq!(fast.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_keep_the_timer_alive() {
        let scheduler = TimerScheduler::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        scheduler
            .add_timer("flaky", Duration::from_secs(1), move || -> TimerFuture {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 => anyhow::bail!("feed unavailable"),
                        1 => panic!("bad data"),
                        _ => Ok(()),
                    }
                })
            })
            .await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_names_run_independently() {
        let scheduler = TimerScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_timer("T1", Duration::from_secs(5), counting(&count))
            .await;
        scheduler
            .add_timer("T1", Duration::from_secs(5), counting(&count))
            .await;
        assert_eq!(scheduler.timer_count().await, 2);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_waiting_timers() {
        let scheduler = TimerScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_timer("t1", Duration::from_secs(5), counting(&count))
            .await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        scheduler.shutdown().await;
        assert!(scheduler.is_stopped());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.timer_count().await, 0);
    }
}

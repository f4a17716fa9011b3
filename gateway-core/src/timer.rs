//! A resettable periodic timer, ported from
//! `original_source/src/gary/util/periodic_timer.py`.
//!
//! The scheduler (§4.6) uses two of these per game: `try_timer` and
//! `force_timer`. Any outbound `action` event resets both; any inbound
//! `context` event resets `try_timer` alone. `reset` cancels whatever sleep
//! is in flight and starts a fresh one; the callback decides whether the
//! timer keeps firing (`true`) or stops (`false`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// A boxed, type-erased async callback so a `Scheduler` can hold both its
/// timers without becoming generic over closure types.
pub type BoxFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

pub struct PeriodicTimer {
    interval: Duration,
    callback: TimerCallback,
    name: String,
    active: bool,
    task: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn new<F, Fut>(interval: Duration, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            interval,
            callback: Arc::new(move || Box::pin(callback()) as BoxFuture),
            name: name.into(),
            active: false,
            task: None,
        }
    }

    /// Starts the timer if not already active. A no-op if already running.
    pub fn start(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.reset();
    }

    /// Stops the timer, cancelling any in-flight sleep.
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.abort();
    }

    /// Cancels any in-flight sleep and, if active, starts a fresh one.
    /// Interval 0 disables firing entirely.
    pub fn reset(&mut self) {
        self.abort();
        if !self.active || self.interval.is_zero() {
            return;
        }
        let interval = self.interval;
        let callback = Arc::clone(&self.callback);
        let name = self.name.clone();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                trace!(timer = %name, "firing");
                let restart = (callback)().await;
                if !restart {
                    break;
                }
            }
        }));
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
        self.reset();
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_repeatedly_while_restart_is_true() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut timer = PeriodicTimer::new(Duration::from_secs(1), "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        timer.start();

        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_delays_next_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut timer = PeriodicTimer::new(Duration::from_secs(1), "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        timer.start();

        tokio::time::advance(Duration::from_millis(800)).await;
        timer.reset();
        tokio::time::advance(Duration::from_millis(800)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut timer = PeriodicTimer::new(Duration::from_secs(1), "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        timer.start();
        timer.stop();
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_interval_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut timer = PeriodicTimer::new(Duration::from_secs(0), "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        timer.start();
        assert!(timer.task.is_none());
    }
}

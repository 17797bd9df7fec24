//! Timers owned by a state machine.
//!
//! A timer posts a message onto its owner's input queue. Dropping or
//! cancelling the timer aborts the underlying task, so nothing fires after the
//! owner tears down. Owners still stamp each message with a generation and
//! ignore stale ones: a message may already be queued when the timer is
//! cancelled.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A cancellable one-shot or repeating timer.
#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// A timer that is not running.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Post `message` once after `delay`.
    pub fn once<T: Send + 'static>(
        delay: Duration,
        tx: mpsc::UnboundedSender<T>,
        message: T,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Post a message every `period`, first one after `period`.
    pub fn every<T, F>(period: Duration, tx: mpsc::UnboundedSender<T>, mut make: F) -> Self
    where
        T: Send + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stop the timer. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = Timer::once(Duration::from_secs(30), tx, "expired");

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), "expired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::once(Duration::from_secs(1), tx, ());
        timer.cancel();
        assert!(!timer.is_active());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(Timer::every(Duration::from_secs(1), tx, || 1u8));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_repeats() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut n = 0u32;
        let _timer = Timer::every(Duration::from_secs(30), tx, move || {
            n += 1;
            n
        });

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }
}

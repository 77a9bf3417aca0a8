//! One-shot and recurring timers backed by a dedicated thread and the
//! monotonic clock.

use crate::common::MonotonicCond;
use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

struct Shared {
    cancelled: Mutex<bool>,
    cond: MonotonicCond,
}

/// A timer that fires a callback after a timeout, either once or repeatedly.
///
/// The recurring variant advances the next deadline only after the callback
/// returns, so a callback that outlives the interval produces catch-up fires
/// instead of drift-free ticks.
pub struct Timer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Timer {
    /// Start a timer that expires once after `timeout`.
    pub fn one_shot<F>(timeout: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            cancelled: Mutex::new(false),
            cond: MonotonicCond::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("timer".into())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                let guard = worker_shared.cancelled.lock().unwrap_or_else(|e| e.into_inner());
                let (guard, cancelled) =
                    worker_shared.cond.wait_until(guard, deadline, |c| *c);
                drop(guard);

                if !cancelled {
                    callback();
                }
            })
            .expect("spawn timer thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Start a timer that fires every `interval` until cancelled.
    pub fn recurring<F>(interval: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            cancelled: Mutex::new(false),
            cond: MonotonicCond::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("timer".into())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                loop {
                    let guard = worker_shared.cancelled.lock().unwrap_or_else(|e| e.into_inner());
                    let (guard, cancelled) =
                        worker_shared.cond.wait_until(guard, next, |c| *c);
                    drop(guard);

                    if cancelled {
                        return;
                    }

                    callback();

                    // deliberately relative to the previous deadline, not to
                    // "now": long callbacks cause catch-up fires
                    next += interval;
                }
            })
            .expect("spawn timer thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Cancel the timer. Blocks until a callback in flight has returned.
    /// Subsequent calls are ignored.
    pub fn cancel(&mut self) {
        {
            let mut cancelled = self
                .shared
                .cancelled
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.shared.cond.notify_all();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_fires_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&counter);

        let _timer = Timer::one_shot(Duration::from_millis(10), move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_shot_cancelled_before_expiry() {
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&counter);

        let mut timer = Timer::one_shot(Duration::from_secs(60), move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_fires_repeatedly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&counter);

        let mut timer = Timer::recurring(Duration::from_millis(10), move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(120));
        timer.cancel();

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected several fires, got {}", fired);
    }

    #[test]
    fn recurring_catches_up_after_slow_callback() {
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&counter);

        let mut timer = Timer::recurring(Duration::from_millis(20), move || {
            if inner.fetch_add(1, Ordering::SeqCst) == 0 {
                // overrun several intervals on the first fire
                thread::sleep(Duration::from_millis(70));
            }
        });

        thread::sleep(Duration::from_millis(200));
        timer.cancel();

        // the overrun intervals fire back-to-back instead of being skipped
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 5, "expected catch-up fires, got {}", fired);
    }

    #[test]
    fn cancel_twice_is_ignored() {
        let mut timer = Timer::one_shot(Duration::from_secs(60), || {});
        timer.cancel();
        timer.cancel();
    }
}

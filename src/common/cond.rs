//! A condition variable with predicate-based timed waits on the monotonic
//! clock, so timeouts are immune to wall-clock jumps.

use std::{
    sync::{Condvar, MutexGuard},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
/// Wrapper around the standard condition variable. All timed waits are
/// expressed against `Instant`, and the absolute deadline is computed exactly
/// once regardless of how often the wait wakes up spuriously.
pub struct MonotonicCond {
    inner: Condvar,
}

impl MonotonicCond {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }

    /// Block until the predicate holds, without timeout.
    pub fn wait<'a, T, P>(&self, mut guard: MutexGuard<'a, T>, mut pred: P) -> MutexGuard<'a, T>
    where
        P: FnMut(&mut T) -> bool,
    {
        while !pred(&mut guard) {
            guard = self.inner.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        guard
    }

    /// Block until the predicate holds or `rel` has elapsed. A zero duration
    /// checks the predicate once and returns. The returned flag is the final
    /// predicate value.
    pub fn wait_for<'a, T, P>(
        &self,
        guard: MutexGuard<'a, T>,
        rel: Duration,
        pred: P,
    ) -> (MutexGuard<'a, T>, bool)
    where
        P: FnMut(&mut T) -> bool,
    {
        self.wait_until(guard, Instant::now() + rel, pred)
    }

    /// Block until the predicate holds or the absolute deadline passes.
    pub fn wait_until<'a, T, P>(
        &self,
        mut guard: MutexGuard<'a, T>,
        deadline: Instant,
        mut pred: P,
    ) -> (MutexGuard<'a, T>, bool)
    where
        P: FnMut(&mut T) -> bool,
    {
        loop {
            if pred(&mut guard) {
                return (guard, true);
            }

            let now = Instant::now();
            if now >= deadline {
                let result = pred(&mut guard);
                return (guard, result);
            }

            guard = self
                .inner
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn zero_timeout_checks_once() {
        let cond = MonotonicCond::new();
        let lock = Mutex::new(false);

        let (_guard, fired) = cond.wait_for(lock.lock().unwrap(), Duration::ZERO, |v| *v);
        assert!(!fired);
    }

    #[test]
    fn timeout_expires() {
        let cond = MonotonicCond::new();
        let lock = Mutex::new(0u32);

        let start = Instant::now();
        let (_guard, fired) = cond.wait_for(lock.lock().unwrap(), Duration::from_millis(50), |v| *v > 0);
        assert!(!fired);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn predicate_already_true_returns_immediately() {
        let cond = MonotonicCond::new();
        let lock = Mutex::new(7u32);

        let (_guard, fired) = cond.wait_for(lock.lock().unwrap(), Duration::from_secs(10), |v| *v == 7);
        assert!(fired);
    }

    #[test]
    fn notified_wait_observes_change() {
        let shared = Arc::new((Mutex::new(false), MonotonicCond::new()));

        let signaller = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            *signaller.0.lock().unwrap() = true;
            signaller.1.notify_all();
        });

        let (lock, cond) = &*shared;
        let (_guard, fired) = cond.wait_for(lock.lock().unwrap(), Duration::from_secs(5), |v| *v);
        assert!(fired);
        handle.join().unwrap();
    }
}

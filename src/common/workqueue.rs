//! Tagged FIFO work queue driving the daemon event loop: single reader
//! (the loop thread), multiple writers (RPC handlers and timers).

use crate::common::MonotonicCond;
use log::warn;
use std::{
    collections::VecDeque,
    sync::Mutex,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

type WorkFunc = Box<dyn FnOnce() + Send + 'static>;

struct WorkItem {
    tag: u64,
    func: WorkFunc,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<WorkItem>,
    counter: u64,
    exit_requested: bool,
    running_thread: Option<ThreadId>,
}

#[derive(Default)]
/// The queue itself. `run_until` is the event loop; `do_work` is the
/// do-and-wait entry point used by callers that need their closure executed
/// on the loop thread before they continue.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    cond: MonotonicCond,
    complete: Mutex<u64>,
    complete_cond: MonotonicCond,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unblock the run functions.
    pub fn exit(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.exit_requested = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// Run the event loop until `exit()` is called.
    pub fn run(&self) {
        self.run_loop(None);
    }

    /// Run the event loop for a fixed amount of time. Returns true iff exit
    /// was requested rather than the timeout expiring.
    pub fn run_for(&self, timeout: Duration) -> bool {
        self.run_until(Instant::now() + timeout)
    }

    /// Run the event loop until the deadline passes or `exit()` is called.
    /// Returns true iff exit was requested.
    pub fn run_until(&self, deadline: Instant) -> bool {
        self.run_loop(Some(deadline))
    }

    fn run_loop(&self, deadline: Option<Instant>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.running_thread = Some(thread::current().id());

        while !inner.exit_requested {
            inner = self.drain(inner);

            let timed_out = match deadline {
                None => {
                    inner = self
                        .cond
                        .wait(inner, |state| state.exit_requested || !state.queue.is_empty());
                    false
                }
                Some(deadline) => {
                    let (guard, fired) = self.cond.wait_until(inner, deadline, |state| {
                        state.exit_requested || !state.queue.is_empty()
                    });
                    inner = guard;
                    !fired
                }
            };

            if timed_out {
                break;
            }
        }

        // best effort to leave no work items behind
        inner = self.drain(inner);

        inner.running_thread = None;
        let result = inner.exit_requested;
        inner.exit_requested = false;
        result
    }

    fn drain<'a>(
        &'a self,
        mut inner: std::sync::MutexGuard<'a, Inner>,
    ) -> std::sync::MutexGuard<'a, Inner> {
        while let Some(work) = inner.queue.pop_front() {
            drop(inner);

            (work.func)();

            let mut complete = self.complete.lock().unwrap_or_else(|e| e.into_inner());
            *complete = work.tag;
            drop(complete);
            self.complete_cond.notify_all();

            inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        }
        inner
    }

    /// Post a work item and wait until it has been executed. When called from
    /// the loop thread itself the closure runs inline to avoid deadlock.
    pub fn do_work<F>(&self, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.running_thread == Some(thread::current().id()) {
            drop(inner);
            work();
            return true;
        }

        inner.counter += 1;
        let tag = inner.counter;
        inner.queue.push_back(WorkItem {
            tag,
            func: Box::new(work),
        });
        drop(inner);
        self.cond.notify_one();

        let mut complete = self.complete.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let (guard, fired) =
                self.complete_cond
                    .wait_for(complete, Duration::from_secs(1), |done| *done >= tag);
            complete = guard;
            if fired {
                return true;
            }
            warn!("been waiting for over a second for work item to execute, soft lock-up?");
        }
    }

    /// Fire-and-forget enqueue.
    pub fn post_work<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counter += 1;
        let tag = inner.counter;
        inner.queue.push_back(WorkItem {
            tag,
            func: Box::new(work),
        });
        drop(inner);
        self.cond.notify_one();
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.queue.is_empty() {
            warn!("destroying work queue with work items still in the queue");
        }
    }
}

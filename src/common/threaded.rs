//! A scoped single-worker dispatcher consuming a FIFO of closures.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
};

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Owns exactly one worker thread; callers never run posted work directly.
pub struct ThreadedDispatcher {
    tx: Sender<Work>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl ThreadedDispatcher {
    /// Spawn the worker thread under the provided name.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Work>();
        let running = Arc::new(AtomicBool::new(true));

        let worker_running = Arc::clone(&running);
        let worker = thread::Builder::new()
            .name(name.into())
            .spawn(move || Self::work_loop(rx, worker_running))
            .expect("spawn dispatcher thread");
        let worker_id = worker.thread().id();

        Self {
            tx,
            running,
            worker: Some(worker),
            worker_id,
        }
    }

    fn work_loop(rx: Receiver<Work>, running: Arc<AtomicBool>) {
        while let Ok(work) = rx.recv() {
            // Pending items behind a stop request are dropped unexecuted.
            if !running.load(Ordering::SeqCst) {
                break;
            }
            work();
        }
    }

    /// Enqueue work for the worker thread. Work posted after the dispatcher
    /// stopped is ignored.
    pub fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            warn!("ignoring work because the dispatcher is not running anymore");
            return;
        }

        if self.tx.send(Box::new(work)).is_err() {
            warn!("dispatcher worker is gone, work dropped");
        }
    }

    /// Block until everything posted before this call has been processed.
    pub fn sync(&self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("ignoring sync because dispatcher is not running");
            return;
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        self.post(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
    }

    /// Process any work remaining in the queue, then stop accepting new work.
    pub fn flush(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("this dispatcher is no longer running, ignoring flush request");
            return;
        }

        let running = Arc::clone(&self.running);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        self.post(move || {
            running.store(false, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();

        // the worker is back on the queue by now, wake it so it can exit
        self.stop();
    }

    /// Cancel any work that is not already in progress and stop accepting new
    /// work.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // wake the worker in case the queue is empty
        let _ = self.tx.send(Box::new(|| {}));
        self.join();
    }

    /// True when called from inside a posted closure. Used to avoid deadlock
    /// in re-entrant cleanup paths.
    pub fn invoked_from_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("dispatcher worker thread panicked");
            }
        }
    }
}

impl Drop for ThreadedDispatcher {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop();
        } else {
            self.join();
        }
    }
}

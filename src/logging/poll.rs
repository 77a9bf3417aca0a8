//! A small epoll-based poll loop running on a dedicated thread, used to pump
//! container stdio while the containers run.

use crate::error::ErrorKind;
use anyhow::{Context, Result};
use log::{trace, warn};
use nix::{
    sys::{
        epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp},
        eventfd::{eventfd, EfdFlags},
    },
    unistd,
};
use std::{
    collections::HashMap,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

const MAX_EVENTS: usize = 32;

/// A source of poll events. Implementations read their fd and may remove
/// themselves from the loop on hangup.
pub trait PollSource: Send + Sync {
    fn process(&self, poll_loop: &PollLoop, events: EpollFlags);
}

struct Inner {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    sources: Mutex<HashMap<RawFd, Arc<dyn PollSource>>>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
/// Shared handle to the loop; cheap to clone into sources and threads.
pub struct PollLoop {
    inner: Arc<Inner>,
}

impl PollLoop {
    /// Create the loop without starting its thread.
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("create epoll instance")
            .context(ErrorKind::SyscallFailed.to_string())?;

        let wake_fd = match eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = unistd::close(epoll_fd);
                return Err(anyhow::Error::new(e)
                    .context("create wakeup eventfd")
                    .context(ErrorKind::SyscallFailed.to_string()));
            }
        };

        let mut wake_event = EpollEvent::new(EpollFlags::EPOLLIN, wake_fd as u64);
        if let Err(e) = epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, wake_fd, &mut wake_event) {
            let _ = unistd::close(epoll_fd);
            let _ = unistd::close(wake_fd);
            return Err(anyhow::Error::new(e)
                .context("register wakeup eventfd")
                .context(ErrorKind::SyscallFailed.to_string()));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                epoll_fd,
                wake_fd,
                sources: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Start the loop thread under the given name.
    pub fn start(&self, name: &str) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handle = self.clone();
        let worker = thread::Builder::new()
            .name(name.into())
            .spawn(move || handle.run())
            .context("spawn poll loop thread")?;

        *self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(worker);
        Ok(())
    }

    /// Stop the loop thread and wait for it to exit. Registered sources stay
    /// registered.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wake();

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("poll loop thread panicked");
            }
        }
    }

    /// Register a source for the given fd and event set.
    pub fn add_source(
        &self,
        fd: RawFd,
        events: EpollFlags,
        source: Arc<dyn PollSource>,
    ) -> Result<()> {
        let mut sources = self
            .inner
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if sources.contains_key(&fd) {
            anyhow::bail!("fd {} already registered on the poll loop", fd);
        }

        let mut event = EpollEvent::new(events, fd as u64);
        epoll_ctl(self.inner.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event)
            .with_context(|| format!("add fd {} to epoll", fd))
            .context(ErrorKind::SyscallFailed.to_string())?;

        sources.insert(fd, source);
        Ok(())
    }

    /// Deregister a source. Unknown fds are tolerated so a hangup path can
    /// race a teardown path.
    pub fn del_source(&self, fd: RawFd) {
        let mut sources = self
            .inner
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if sources.remove(&fd).is_none() {
            trace!("fd {} was not registered", fd);
            return;
        }

        let mut event = EpollEvent::new(EpollFlags::empty(), 0);
        if let Err(e) = epoll_ctl(self.inner.epoll_fd, EpollOp::EpollCtlDel, fd, &mut event) {
            warn!("failed to remove fd {} from epoll: {}", fd, e);
        }
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.inner
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn wake(&self) {
        let one = 1u64.to_ne_bytes();
        if let Err(e) = unistd::write(self.inner.wake_fd, &one) {
            warn!("failed to wake poll loop: {}", e);
        }
    }

    fn run(&self) {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        while self.inner.running.load(Ordering::SeqCst) {
            let count = match epoll_wait(self.inner.epoll_fd, &mut events, -1) {
                Ok(count) => count,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => {
                    warn!("epoll wait failed: {}", e);
                    break;
                }
            };

            for event in events.iter().take(count) {
                let fd = event.data() as RawFd;
                if fd == self.inner.wake_fd {
                    let mut drain = [0u8; 8];
                    let _ = unistd::read(self.inner.wake_fd, &mut drain);
                    continue;
                }

                let source = {
                    let sources = self
                        .inner
                        .sources
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    sources.get(&fd).cloned()
                };

                if let Some(source) = source {
                    source.process(self, event.events());
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = unistd::close(self.epoll_fd);
        let _ = unistd::close(self.wake_fd);
    }
}

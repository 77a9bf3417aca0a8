//! Container-stdio logging: a per-container pump forwarding ptty output to a
//! configured sink, driven by the daemon's poll loop.

mod poll;
mod sink;

pub use poll::{PollLoop, PollSource};
pub use sink::{FileSink, JournaldSink, LoggingSink, NullSink, SinkSpec, JOURNALD_STREAM_SOCKET};

use log::{debug, warn};
use nix::{
    errno::Errno,
    fcntl::{self, FcntlArg, OFlag},
    sys::epoll::EpollFlags,
    unistd,
};
use std::{
    os::unix::io::RawFd,
    sync::Mutex,
};

const READ_BUF_SIZE: usize = 4096;

/// Binds one sink to one container ptty. Registered as an edge-triggered
/// poll source; deregisters itself and closes its descriptors on hangup.
pub struct LoggingPump {
    container_id: String,
    ptty_fd: Mutex<Option<RawFd>>,
    connection_fd: Mutex<Option<RawFd>>,
    sink: Mutex<Box<dyn LoggingSink>>,
}

impl LoggingPump {
    /// Create the pump over a ptty fd and an optional control-connection fd
    /// that is closed together with the ptty on hangup. The ptty is switched
    /// to non-blocking so the drain loop can stop at EAGAIN.
    pub fn new(
        container_id: &str,
        ptty_fd: RawFd,
        connection_fd: Option<RawFd>,
        sink: Box<dyn LoggingSink>,
    ) -> anyhow::Result<Self> {
        set_nonblocking(ptty_fd)?;

        Ok(Self {
            container_id: container_id.into(),
            ptty_fd: Mutex::new(Some(ptty_fd)),
            connection_fd: Mutex::new(connection_fd),
            sink: Mutex::new(sink),
        })
    }

    /// The event set the pump wants from the poll loop.
    pub fn poll_events() -> EpollFlags {
        EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLET
    }

    /// Synchronously drain an arbitrary fd into the sink. Shares the sink
    /// lock with the poll callback so flushes never interleave with pumped
    /// output.
    pub fn dump_to_log(&self, fd: RawFd) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        Self::drain(fd, sink.as_mut(), &self.container_id);
    }

    /// Drain an fd into an arbitrary sink, outside of any pump.
    pub fn drain_into(fd: RawFd, sink: &mut dyn LoggingSink, container_id: &str) {
        Self::drain(fd, sink, container_id)
    }

    fn drain(fd: RawFd, sink: &mut dyn LoggingSink, container_id: &str) {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match unistd::read(fd, &mut buf) {
                Ok(0) => return,
                Ok(count) => sink.write_logs(&buf[..count]),
                Err(nix::Error::Sys(Errno::EAGAIN)) => return,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => {
                    warn!("read from container {} tty failed: {}", container_id, e);
                    return;
                }
            }
        }
    }

    fn hangup(&self, poll_loop: &PollLoop) {
        debug!(
            "container {} tty hung up, removing pump from the poll loop",
            self.container_id
        );

        let fd = self
            .ptty_fd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(fd) = fd {
            poll_loop.del_source(fd);
            if let Err(e) = unistd::close(fd) {
                warn!("failed to close container ptty fd {}: {}", fd, e);
            }
        }

        let connection = self
            .connection_fd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(fd) = connection {
            if let Err(e) = unistd::close(fd) {
                warn!("failed to close container connection fd {}: {}", fd, e);
            }
        }
    }
}

impl PollSource for LoggingPump {
    fn process(&self, poll_loop: &PollLoop, events: EpollFlags) {
        if events.contains(EpollFlags::EPOLLIN) {
            let fd = *self.ptty_fd.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(fd) = fd {
                let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
                Self::drain(fd, sink.as_mut(), &self.container_id);
            }
        }

        if events.contains(EpollFlags::EPOLLHUP) {
            self.hangup(poll_loop);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    use anyhow::Context;

    let flags = fcntl::fcntl(fd, FcntlArg::F_GETFL).context("read fd flags")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(fd, FcntlArg::F_SETFL(flags)).context("set fd non-blocking")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };
    use tempfile::TempDir;

    fn pipe_pair() -> Result<(RawFd, RawFd)> {
        Ok(unistd::pipe2(OFlag::O_CLOEXEC)?)
    }

    fn wait_for(predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn pump_writes_stream_to_file_under_cap() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("c1.log");
        let (read_fd, write_fd) = pipe_pair()?;

        let sink = Box::new(FileSink::new("c1", &path, Some(1024))?);
        let pump = Arc::new(LoggingPump::new("c1", read_fd, None, sink)?);

        let poll_loop = PollLoop::new()?;
        poll_loop.add_source(read_fd, LoggingPump::poll_events(), pump)?;
        poll_loop.start("test-logging")?;

        let mut payload = Vec::new();
        for i in 0..2048u32 {
            payload.push((i % 251) as u8);
        }
        unistd::write(write_fd, &payload)?;
        unistd::close(write_fd)?;

        // hangup makes the pump remove itself once everything is drained
        assert!(wait_for(|| poll_loop.source_count() == 0));
        poll_loop.stop();

        let written = std::fs::read(&path)?;
        assert_eq!(written.len(), 1024);
        assert_eq!(written[..], payload[..1024]);
        Ok(())
    }

    #[test]
    fn dump_to_log_flushes_synchronously() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("c1.log");
        let (read_fd, write_fd) = pipe_pair()?;
        let (buffer_read, buffer_write) = pipe_pair()?;

        let sink = Box::new(FileSink::new("c1", &path, None)?);
        let pump = LoggingPump::new("c1", read_fd, None, sink)?;

        unistd::write(buffer_write, b"flushed output")?;
        unistd::close(buffer_write)?;
        pump.dump_to_log(buffer_read);

        assert_eq!(std::fs::read_to_string(&path)?, "flushed output");

        unistd::close(buffer_read)?;
        unistd::close(write_fd)?;
        Ok(())
    }

    #[test]
    fn hangup_closes_connection_fd() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("c1.log");
        let (read_fd, write_fd) = pipe_pair()?;
        let (conn_read, conn_write) = pipe_pair()?;

        let sink = Box::new(FileSink::new("c1", &path, None)?);
        let pump = Arc::new(LoggingPump::new("c1", read_fd, Some(conn_read), sink)?);

        let poll_loop = PollLoop::new()?;
        poll_loop.add_source(read_fd, LoggingPump::poll_events(), pump.clone())?;
        poll_loop.start("test-logging")?;

        unistd::write(write_fd, b"bye")?;
        unistd::close(write_fd)?;
        assert!(wait_for(|| poll_loop.source_count() == 0));
        poll_loop.stop();

        // the hangup path closed and cleared both descriptors
        assert!(pump.ptty_fd.lock().unwrap().is_none());
        assert!(pump.connection_fd.lock().unwrap().is_none());
        unistd::close(conn_write)?;
        Ok(())
    }
}

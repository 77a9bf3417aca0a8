//! Sink implementations for container stdio: size-capped file, journald
//! stream and the void.

use crate::error::ErrorKind;
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
};

/// Where journald accepts stream connections.
pub const JOURNALD_STREAM_SOCKET: &str = "/run/systemd/journal/stdout";

/// A destination for container stdio bytes. Writes preserve the order the
/// bytes were read from the ptty; callers serialize access externally.
pub trait LoggingSink: Send {
    fn write_logs(&mut self, data: &[u8]);
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase", tag = "sink")]
/// Sink selection as it appears in the logging plugin's config data.
pub enum SinkSpec {
    File {
        path: PathBuf,
        /// Byte cap for the output file; absent means unlimited.
        #[serde(default)]
        limit: Option<u64>,
    },
    Journald {
        #[serde(default)]
        priority: Option<u8>,
    },
    Devnull,
}

impl SinkSpec {
    /// Build the sink for a container. A sink that cannot reach its real
    /// destination degrades to /dev/null rather than blocking the container's
    /// stdio.
    pub fn create_sink(&self, container_id: &str) -> Result<Box<dyn LoggingSink>> {
        Ok(match self {
            SinkSpec::File { path, limit } => {
                Box::new(FileSink::new(container_id, path, *limit)?)
            }
            SinkSpec::Journald { priority } => Box::new(JournaldSink::connect(
                Path::new(JOURNALD_STREAM_SOCKET),
                container_id,
                priority.unwrap_or(6),
            )?),
            SinkSpec::Devnull => Box::new(NullSink::new()?),
        })
    }
}

/// Writes to a file under a byte cap. Once the cap is reached, further bytes
/// go to /dev/null and the cap hit is logged a single time. The output file
/// never exceeds the cap, so the final chunk is split when needed.
pub struct FileSink {
    container_id: String,
    output: File,
    dev_null: File,
    limit: Option<u64>,
    written: u64,
    limit_hit: bool,
}

impl FileSink {
    pub fn new(container_id: &str, path: &Path, limit: Option<u64>) -> Result<Self> {
        let dev_null = open_dev_null()?;

        let output = match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
            Ok(file) => file,
            Err(e) => {
                // a broken log path must not block the container's stdio
                warn!(
                    "failed to open container logfile {}, sending to /dev/null: {}",
                    path.display(),
                    e
                );
                dev_null.try_clone().context("clone /dev/null handle")?
            }
        };

        Ok(Self {
            container_id: container_id.into(),
            output,
            dev_null,
            limit,
            written: 0,
            limit_hit: false,
        })
    }
}

impl LoggingSink for FileSink {
    fn write_logs(&mut self, data: &[u8]) {
        let allowed = match self.limit {
            None => data.len(),
            Some(limit) => (limit.saturating_sub(self.written) as usize).min(data.len()),
        };

        if allowed > 0 {
            if let Err(e) = self.output.write_all(&data[..allowed]) {
                warn!("write to container {} logfile failed: {}", self.container_id, e);
            }
            self.written += allowed as u64;
        }

        if allowed < data.len() {
            if !self.limit_hit {
                warn!(
                    "logger for container {} has hit maximum size of {}",
                    self.container_id,
                    self.limit.unwrap_or_default()
                );
                self.limit_hit = true;
            }
            let _ = self.dev_null.write_all(&data[allowed..]);
        }
    }
}

/// Writes through a pre-opened stream connection to journald.
pub struct JournaldSink {
    container_id: String,
    stream: UnixStream,
}

impl JournaldSink {
    /// Connect to the journald stream socket and send the stream header
    /// naming the container and its syslog priority (0..=7).
    pub fn connect(socket: &Path, container_id: &str, priority: u8) -> Result<Self> {
        let mut stream = UnixStream::connect(socket)
            .with_context(|| format!("connect to {}", socket.display()))
            .context(ErrorKind::ResourceUnavailable.to_string())?;

        // stream header: identifier, unit, priority, level prefix and the
        // three forwarding flags, one line each
        let header = format!("{}\n\n{}\n0\n0\n0\n0\n", container_id, priority.min(7));
        stream
            .write_all(header.as_bytes())
            .context("write journald stream header")
            .context(ErrorKind::IoFailed.to_string())?;

        Ok(Self {
            container_id: container_id.into(),
            stream,
        })
    }
}

impl LoggingSink for JournaldSink {
    fn write_logs(&mut self, data: &[u8]) {
        if let Err(e) = self.stream.write_all(data) {
            debug!(
                "journald write for container {} failed: {}",
                self.container_id, e
            );
        }
    }
}

/// Discards everything.
pub struct NullSink {
    dev_null: File,
}

impl NullSink {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dev_null: open_dev_null()?,
        })
    }
}

impl LoggingSink for NullSink {
    fn write_logs(&mut self, data: &[u8]) {
        let _ = self.dev_null.write_all(data);
    }
}

fn open_dev_null() -> Result<File> {
    OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")
        .context(ErrorKind::ResourceUnavailable.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{io::Read, os::unix::net::UnixListener};
    use tempfile::TempDir;

    #[test]
    fn file_sink_respects_exact_limit() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("c1.log");
        let mut sink = FileSink::new("c1", &path, Some(1024))?;

        let payload = vec![b'x'; 2048];
        sink.write_logs(&payload[..700]);
        sink.write_logs(&payload[700..1400]); // crosses the cap mid-chunk
        sink.write_logs(&payload[1400..]);

        assert_eq!(std::fs::metadata(&path)?.len(), 1024);
        assert!(sink.limit_hit);
        Ok(())
    }

    #[test]
    fn file_sink_unlimited() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("c1.log");
        let mut sink = FileSink::new("c1", &path, None)?;

        sink.write_logs(&vec![b'y'; 4096]);
        sink.write_logs(&vec![b'y'; 4096]);

        assert_eq!(std::fs::metadata(&path)?.len(), 8192);
        assert!(!sink.limit_hit);
        Ok(())
    }

    #[test]
    fn file_sink_bad_path_degrades_to_dev_null() -> Result<()> {
        let mut sink = FileSink::new("c1", Path::new("/no/such/dir/c1.log"), Some(10))?;
        sink.write_logs(b"dropped");
        Ok(())
    }

    #[test]
    fn journald_sink_sends_header_then_data() -> Result<()> {
        let dir = TempDir::new()?;
        let socket = dir.path().join("stdout");
        let listener = UnixListener::bind(&socket)?;

        let mut sink = JournaldSink::connect(&socket, "c1", 5)?;
        sink.write_logs(b"hello journal\n");
        drop(sink);

        let (mut conn, _) = listener.accept()?;
        let mut received = String::new();
        conn.read_to_string(&mut received)?;

        assert_eq!(received, "c1\n\n5\n0\n0\n0\n0\nhello journal\n");
        Ok(())
    }

    #[test]
    fn journald_priority_clamped() -> Result<()> {
        let dir = TempDir::new()?;
        let socket = dir.path().join("stdout");
        let listener = UnixListener::bind(&socket)?;

        let sink = JournaldSink::connect(&socket, "c1", 200)?;
        drop(sink);

        let (mut conn, _) = listener.accept()?;
        let mut received = String::new();
        conn.read_to_string(&mut received)?;
        assert!(received.starts_with("c1\n\n7\n"));
        Ok(())
    }

    #[test]
    fn null_sink_swallows_everything() -> Result<()> {
        let mut sink = NullSink::new()?;
        sink.write_logs(&vec![0u8; 1 << 16]);
        Ok(())
    }

    #[test]
    fn sink_spec_parses_from_plugin_data() -> Result<()> {
        let spec: SinkSpec =
            serde_json::from_str(r#"{"sink": "file", "path": "/tmp/c1.log", "limit": 65536}"#)?;
        assert_eq!(
            spec,
            SinkSpec::File {
                path: PathBuf::from("/tmp/c1.log"),
                limit: Some(65536)
            }
        );

        let spec: SinkSpec = serde_json::from_str(r#"{"sink": "journald"}"#)?;
        assert_eq!(spec, SinkSpec::Journald { priority: None });

        let spec: SinkSpec = serde_json::from_str(r#"{"sink": "devnull"}"#)?;
        assert_eq!(spec, SinkSpec::Devnull);
        Ok(())
    }
}

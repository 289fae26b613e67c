//! Line-delimited byte transports
//!
//! A transport carries newline-terminated JSON frames over either the
//! stdin/stdout pipes of a spawned process or a TCP socket. It knows nothing
//! about the protocol riding on top.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::error::{ProtocolError, ProtocolResult};

/// Frames above this size are discarded instead of parsed.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to reach a protocol server
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Spawn a process and talk over its stdin/stdout
    Stdio {
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<PathBuf>,
    },
    /// Connect to a listening socket, retrying until `connect_window` elapses
    Tcp {
        address: String,
        connect_window: Duration,
    },
}

impl TransportConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        TransportConfig::Stdio {
            command: command.into(),
            args,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        TransportConfig::Tcp {
            address: address.into(),
            connect_window: Duration::from_secs(10),
        }
    }
}

/// Everything needed to open a session against one server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub transport: TransportConfig,
    pub call_timeout: Duration,
}

/// Reads complete newline-terminated frames, buffering partial reads.
///
/// At most [`MAX_FRAME_BYTES`] of a single frame are ever held. Once a frame
/// grows past that, the rest of it is skipped up to its terminator and
/// reading resumes with the next frame.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(4096),
            discarding: false,
        }
    }

    /// Next complete frame, without its terminator.
    ///
    /// Returns `Ok(None)` at end of stream. A trailing record with no
    /// terminator is incomplete and dropped. Cancel safe: partial frames stay
    /// buffered across calls.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let chunk = self.inner.fill_buf().await?;
            if chunk.is_empty() {
                if !self.buf.is_empty() || self.discarding {
                    debug!(bytes = self.buf.len(), "Dropping unterminated frame at end of stream");
                }
                self.buf.clear();
                self.discarding = false;
                return Ok(None);
            }

            let (consumed, complete) = match chunk.iter().position(|b| *b == b'\n') {
                Some(at) => (at + 1, true),
                None => (chunk.len(), false),
            };
            let line = &chunk[..if complete { consumed - 1 } else { consumed }];

            if !self.discarding {
                if self.buf.len() + line.len() > MAX_FRAME_BYTES {
                    warn!(
                        bytes = self.buf.len() + line.len(),
                        "Discarding oversized frame"
                    );
                    self.discarding = true;
                    self.buf = Vec::new();
                } else {
                    self.buf.extend_from_slice(line);
                }
            }
            self.inner.consume(consumed);

            if !complete || std::mem::take(&mut self.discarding) {
                continue;
            }

            let mut frame = std::mem::take(&mut self.buf);
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

/// Writes one serialized value per line.
pub struct FrameWriter {
    inner: BoxedWriter,
}

impl FrameWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self { inner: writer }
    }

    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> ProtocolResult<()> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// An open byte channel to a server, plus the process behind it if we own one.
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub child: Option<Child>,
}

impl Connection {
    /// Wrap arbitrary streams, e.g. an in-memory duplex pipe.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    /// Attach a process whose lifetime should follow this connection.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub async fn open(config: &TransportConfig) -> ProtocolResult<Self> {
        match config {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => Self::spawn_stdio(command, args, env, cwd.as_ref()),
            TransportConfig::Tcp {
                address,
                connect_window,
            } => Self::connect_tcp(address, *connect_window).await,
        }
    }

    fn spawn_stdio(
        command: &str,
        args: &[String],
        env: &[(String, String)],
        cwd: Option<&PathBuf>,
    ) -> ProtocolResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ProtocolError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ProtocolError::Spawn {
            command: command.to_string(),
            reason: "stdin was not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ProtocolError::Spawn {
            command: command.to_string(),
            reason: "stdout was not captured".to_string(),
        })?;

        info!(command = %command, pid = ?child.id(), "Spawned protocol server process");

        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    async fn connect_tcp(address: &str, connect_window: Duration) -> ProtocolResult<Self> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Some(connect_window),
            ..Default::default()
        };

        let stream = backoff::future::retry(policy, || async {
            TcpStream::connect(address)
                .await
                .map_err(backoff::Error::transient)
        })
        .await
        .map_err(|e| ProtocolError::Transport(format!("Failed to connect to {}: {}", address, e)))?;

        debug!(address = %address, "Connected to protocol server");

        let (reader, writer) = stream.into_split();
        Ok(Self::from_io(reader, writer))
    }
}

//! Byte channels to a remote store process.
//!
//! A [`Transport`] is a duplex stream plus whatever keeps it alive: the
//! child process that owns the other end and the task that drains its
//! diagnostics. [`Connect`] is how the pool obtains new ones; [`SshConnector`]
//! launches `ssh <host> <program> --serve --write`.

use std::fmt;
use std::io;
use std::process::Stdio;
#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::Config;

/// Buffer size for both directions of the stream.
const BUF_SIZE: usize = 64 * 1024;

/// Reading half of a transport.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writing half of a transport.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Destination for text the remote writes to its diagnostic stream.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub enum DiagnosticSink {
    /// Share this process's stderr.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Forward each line as a `tracing` event on target `sshstore::remote`,
    /// decoded lossily.
    Tracing,
    /// Write to the given descriptor.
    #[cfg(unix)]
    Fd(Arc<OwnedFd>),
}

impl DiagnosticSink {
    /// Builds the child's stderr configuration.
    fn stdio(&self) -> io::Result<Stdio> {
        Ok(match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
            Self::Tracing => Stdio::piped(),
            #[cfg(unix)]
            Self::Fd(fd) => Stdio::from(fd.try_clone()?),
        })
    }
}

/// A connected duplex stream to a remote store process.
pub struct Transport {
    /// Buffered response stream.
    pub(crate) reader: BufReader<BoxReader>,
    /// Buffered request stream; flushed at the end of each request.
    pub(crate) writer: BufWriter<BoxWriter>,
    /// Process holding the other end; killed when the transport drops.
    child: Option<Child>,
    /// Task forwarding the diagnostic stream.
    diagnostics: Option<JoinHandle<()>>,
}

impl Transport {
    /// Wraps an already connected stream.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: BufReader::with_capacity(BUF_SIZE, Box::new(reader)),
            writer: BufWriter::with_capacity(BUF_SIZE, Box::new(writer)),
            child: None,
            diagnostics: None,
        }
    }

    /// Ties the lifetime of `child` to this transport.
    #[must_use]
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Ties the lifetime of a diagnostics task to this transport.
    #[must_use]
    pub fn with_diagnostics(mut self, task: JoinHandle<()>) -> Self {
        self.diagnostics = Some(task);
        self
    }

    /// Tears the channel down: kills the child and stops diagnostics.
    pub fn shutdown(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
        if let Some(task) = self.diagnostics.take() {
            task.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .field("diagnostics", &self.diagnostics.is_some())
            .finish_non_exhaustive()
    }
}

/// Opens new transports for a pool.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Establishes one fresh transport.
    async fn connect(&self) -> io::Result<Transport>;
}

/// Launches the remote program through `ssh`.
#[derive(Debug, Clone)]
pub struct SshConnector {
    /// `[user@]host`.
    host: String,
    /// Identity file.
    key: Option<PathBuf>,
    /// Pass `-C`.
    compress: bool,
    /// Remote command line, already shell-quoted.
    remote_command: String,
    /// Where stderr goes.
    sink: DiagnosticSink,
}

impl SshConnector {
    /// Creates a connector from store settings.
    pub fn new(config: &Config) -> Self {
        let mut remote_command = format!("{} --serve --write", config.program());
        if let Some(store) = config.store() {
            remote_command.push_str(" --store ");
            remote_command.push_str(&shell_escape::unix::escape(store.into()));
        }
        Self {
            host: config.host().to_owned(),
            key: config.key().map(PathBuf::from),
            compress: config.compressed(),
            remote_command,
            sink: config.sink().clone(),
        }
    }

    /// Returns the argument vector passed to `ssh`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-x".to_owned(), "-a".to_owned()];
        if let Some(key) = &self.key {
            args.push("-i".to_owned());
            args.push(key.to_string_lossy().into_owned());
        }
        if self.compress {
            args.push("-C".to_owned());
        }
        args.push("--".to_owned());
        args.push(self.host.clone());
        args.push(self.remote_command.clone());
        args
    }
}

#[async_trait]
impl Connect for SshConnector {
    async fn connect(&self) -> io::Result<Transport> {
        tracing::debug!(host = %self.host, command = %self.remote_command, "spawning ssh");
        let mut child = Command::new("ssh")
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.sink.stdio()?)
            .kill_on_drop(true)
            .spawn()?;

        let missing = || io::Error::other("ssh child has no stdio pipe");
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let mut transport = Transport::new(stdout, stdin);

        if let Some(stderr) = child.stderr.take() {
            let task = forward_diagnostics(self.host.clone(), stderr);
            transport = transport.with_diagnostics(task);
        }
        Ok(transport.with_child(child))
    }
}

/// Spawns a task logging each line of `stream` on target `sshstore::remote`.
fn forward_diagnostics(
    host: String,
    stream: impl AsyncRead + Send + Unpin + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let drained = drain_lines(&mut reader, |line| {
            let text = String::from_utf8_lossy(line);
            tracing::info!(target: "sshstore::remote", %host, "{text}");
        })
        .await;
        tracing::debug!(%host, bytes = drained, "remote diagnostics closed");
    })
}

/// Hands every line of `reader` to `emit` until EOF; returns the byte count.
///
/// Lines are raw bytes without the trailing newline. The stream stays open
/// until EOF so the remote never writes into a closed pipe; after a read
/// error the rest is discarded.
async fn drain_lines<R, F>(reader: &mut R, mut emit: F) -> u64
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut total = 0_u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return total,
            Ok(n) => {
                total += n as u64;
                emit(line.strip_suffix(b"\n").unwrap_or(&line));
            }
            Err(e) => {
                tracing::warn!(error = %e, "reading remote diagnostics failed");
                let rest = tokio::io::copy(reader, &mut tokio::io::sink())
                    .await
                    .unwrap_or_default();
                return total + rest;
            }
        }
    }
}

//! One handshake-negotiated connection to a remote store.
//!
//! A [`Session`] owns its [`Transport`] exclusively and carries one exchange
//! at a time. Every exchange is bracketed by [`Session::begin`] and
//! [`Session::finish`]; a future dropped between the two leaves the request
//! sequence unbalanced, which marks the session unhealthy so the pool never
//! recycles a stream positioned mid-frame.

use std::collections::BTreeSet;

use sshstore_proto::handshake;
use sshstore_proto::{Command, ProtocolVersion, wire};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

use crate::path::{StoreDir, StorePath};
use crate::transport::{BoxReader, BoxWriter, Transport};
use crate::{Error, Result};

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    /// Transport open, nothing exchanged yet.
    Unconnected,
    /// Hello sent, waiting for the server's reply.
    Handshaking,
    /// Accepting requests.
    Ready,
    /// Terminal; every operation fails with [`Error::Closed`].
    Closed,
}

/// A protocol session over one transport.
#[derive(Debug)]
pub struct Session {
    /// Pool-assigned identifier, for logs.
    id: u64,
    /// The byte stream.
    transport: Transport,
    /// Lifecycle state.
    state: State,
    /// Version in effect after the handshake.
    version: ProtocolVersion,
    /// Text the server sent after its version.
    greeting: String,
    /// Store directory used to print and parse paths.
    store_dir: StoreDir,
    /// Number of exchanges begun.
    started: u64,
    /// Number of exchanges finished cleanly.
    completed: u64,
}

impl Session {
    /// Wraps a transport without talking to the remote yet.
    pub fn new(id: u64, transport: Transport, store_dir: StoreDir) -> Self {
        Self {
            id,
            transport,
            state: State::Unconnected,
            version: ProtocolVersion::new(0, 0),
            greeting: String::new(),
            store_dir,
            started: 0,
            completed: 0,
        }
    }

    /// Wraps a transport and performs the handshake.
    pub async fn open(
        id: u64,
        transport: Transport,
        store_dir: StoreDir,
        client_version: ProtocolVersion,
    ) -> Result<Self> {
        let mut session = Self::new(id, transport, store_dir);
        session.handshake(client_version).await?;
        Ok(session)
    }

    /// Exchanges magic words and versions, then drains the greeting.
    ///
    /// The negotiated version is the component-wise minimum of
    /// `client_version` and the server's maximum. Any failure closes the
    /// session.
    pub async fn handshake(&mut self, client_version: ProtocolVersion) -> Result<()> {
        match self.state {
            State::Unconnected => {}
            State::Closed => return Err(Error::Closed),
            State::Handshaking | State::Ready => {
                return Err(Error::Protocol("handshake already performed".into()));
            }
        }
        self.state = State::Handshaking;
        let hello = async {
            handshake::write_client_hello(&mut self.transport.writer, client_version).await?;
            handshake::read_server_hello(&mut self.transport.reader).await
        }
        .await;
        let hello = match hello {
            Ok(hello) => hello,
            Err(e) => {
                self.close();
                return Err(e.into());
            }
        };
        self.version = client_version.negotiate(hello.version);
        self.greeting = hello.greeting;
        self.state = State::Ready;
        tracing::debug!(
            session = self.id,
            server = %hello.version,
            negotiated = %self.version,
            greeting = %self.greeting,
            "handshake complete"
        );
        Ok(())
    }

    /// Returns the pool-assigned identifier.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the lifecycle state.
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns the negotiated version.
    pub const fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Returns the server's greeting text.
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// Returns the store directory paths are printed against.
    pub const fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    /// Returns `true` if the session may carry another exchange.
    pub const fn is_healthy(&self) -> bool {
        matches!(self.state, State::Ready) && self.started == self.completed
    }

    /// Closes the session and tears down its transport.
    pub fn close(&mut self) {
        if self.state != State::Closed {
            tracing::debug!(session = self.id, "closing session");
        }
        self.state = State::Closed;
        self.transport.shutdown();
    }

    /// Starts an exchange for `cmd`, returning its sequence number.
    pub(crate) fn begin(&mut self, cmd: Command) -> Result<u64> {
        match self.state {
            State::Ready => {}
            State::Closed => return Err(Error::Closed),
            State::Unconnected | State::Handshaking => {
                return Err(Error::Protocol(format!("{} before handshake", cmd.name())));
            }
        }
        if self.started != self.completed {
            self.close();
            return Err(Error::Protocol(format!(
                "{} issued while exchange {} was unfinished",
                cmd.name(),
                self.started
            )));
        }
        self.started += 1;
        tracing::trace!(session = self.id, seq = self.started, op = cmd.name(), "request");
        Ok(self.started)
    }

    /// Ends exchange `seq`.
    ///
    /// Errors that leave the stream position unknown close the session.
    pub(crate) fn finish<T>(&mut self, seq: u64, result: Result<T>) -> Result<T> {
        match result {
            Ok(_) | Err(Error::NotFound(_)) => {
                self.completed = seq;
                result
            }
            Err(Error::InvalidPath(msg)) => {
                self.discard(seq, &msg);
                Err(Error::Protocol(format!("remote sent an invalid path: {msg}")))
            }
            Err(e) => {
                self.discard(seq, &e);
                Err(e)
            }
        }
    }

    /// Closes the session after a failed exchange.
    fn discard(&mut self, seq: u64, reason: &dyn std::fmt::Display) {
        tracing::warn!(session = self.id, seq, %reason, "discarding session");
        self.close();
    }

    // Framing helpers. All of them assume an open exchange.

    /// Sends an opcode.
    pub(crate) async fn send_command(&mut self, cmd: Command) -> Result<()> {
        Ok(sshstore_proto::write_command(&mut self.transport.writer, cmd).await?)
    }

    /// Sends a word.
    pub(crate) async fn send_u64(&mut self, n: u64) -> Result<()> {
        Ok(wire::write_u64(&mut self.transport.writer, n).await?)
    }

    /// Sends a flag.
    pub(crate) async fn send_bool(&mut self, b: bool) -> Result<()> {
        Ok(wire::write_bool(&mut self.transport.writer, b).await?)
    }

    /// Sends a string.
    pub(crate) async fn send_str(&mut self, s: &str) -> Result<()> {
        Ok(wire::write_str(&mut self.transport.writer, s).await?)
    }

    /// Sends a sequence of strings.
    pub(crate) async fn send_strings<I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator + Send,
        I::IntoIter: ExactSizeIterator + Send,
        I::Item: AsRef<str> + Send,
    {
        Ok(wire::write_strings(&mut self.transport.writer, items).await?)
    }

    /// Sends a full path.
    pub(crate) async fn send_path(&mut self, path: &StorePath) -> Result<()> {
        let printed = self.store_dir.print(path);
        self.send_str(&printed).await
    }

    /// Sends an optional path, `""` standing for none.
    pub(crate) async fn send_opt_path(&mut self, path: Option<&StorePath>) -> Result<()> {
        let printed = path.map(|p| self.store_dir.print(p)).unwrap_or_default();
        self.send_str(&printed).await
    }

    /// Sends a sequence of full paths.
    pub(crate) async fn send_paths(&mut self, paths: &BTreeSet<StorePath>) -> Result<()> {
        let printed: Vec<String> = paths.iter().map(|p| self.store_dir.print(p)).collect();
        self.send_strings(&printed).await
    }

    /// Flushes buffered request bytes.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        Ok(self.transport.writer.flush().await?)
    }

    /// Reads a word.
    pub(crate) async fn recv_u64(&mut self) -> Result<u64> {
        Ok(wire::read_u64(&mut self.transport.reader).await?)
    }

    /// Reads a flag.
    pub(crate) async fn recv_bool(&mut self) -> Result<bool> {
        Ok(wire::read_bool(&mut self.transport.reader).await?)
    }

    /// Reads a string.
    pub(crate) async fn recv_string(&mut self) -> Result<String> {
        Ok(wire::read_string(&mut self.transport.reader).await?)
    }

    /// Reads a sequence of strings.
    pub(crate) async fn recv_strings(&mut self) -> Result<Vec<String>> {
        Ok(wire::read_strings(&mut self.transport.reader).await?)
    }

    /// Reads a path that may be empty.
    pub(crate) async fn recv_opt_path(&mut self) -> Result<Option<StorePath>> {
        let s = self.recv_string().await?;
        if s.is_empty() {
            Ok(None)
        } else {
            self.store_dir.parse(&s).map(Some)
        }
    }

    /// Reads a sequence of paths.
    pub(crate) async fn recv_paths(&mut self) -> Result<BTreeSet<StorePath>> {
        self.recv_strings()
            .await?
            .iter()
            .map(|s| self.store_dir.parse(s))
            .collect()
    }

    /// Gives archive copiers direct access to the stream.
    pub(crate) fn streams(&mut self) -> (&mut BufReader<BoxReader>, &mut BufWriter<BoxWriter>) {
        (&mut self.transport.reader, &mut self.transport.writer)
    }
}

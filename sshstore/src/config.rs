//! Store connection settings.

use std::path::PathBuf;

use sshstore_proto::ProtocolVersion;

use crate::path::StoreDir;
use crate::transport::DiagnosticSink;
use crate::{Error, Result};

/// URI scheme handled by this client.
pub const SCHEME: &str = "ssh";

/// Default program started on the remote host.
pub const DEFAULT_REMOTE_PROGRAM: &str = "nix-store";

/// Settings for an [`SshStore`](crate::SshStore).
///
/// ```
/// use sshstore::Config;
///
/// let config = Config::new("builder.example.org")
///     .max_connections(4)
///     .compress(true);
/// assert_eq!(config.uri(), "ssh://builder.example.org");
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct Config {
    /// `[user@]host` handed to ssh.
    host: String,
    /// Program invoked with `--serve --write` on the remote.
    remote_program: String,
    /// Store URI passed to the remote program with `--store`.
    remote_store: Option<String>,
    /// Upper bound on concurrently open sessions.
    max_connections: usize,
    /// Identity file for ssh.
    ssh_key: Option<PathBuf>,
    /// Ask ssh to compress the stream.
    compress: bool,
    /// Store directory on the remote.
    store_dir: StoreDir,
    /// Where the remote's stderr goes.
    diagnostics: DiagnosticSink,
    /// Highest protocol version offered in the handshake.
    max_version: ProtocolVersion,
}

impl Config {
    /// Creates settings for `host` with all defaults.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            remote_program: DEFAULT_REMOTE_PROGRAM.to_owned(),
            remote_store: None,
            max_connections: 1,
            ssh_key: None,
            compress: false,
            store_dir: StoreDir::default(),
            diagnostics: DiagnosticSink::default(),
            max_version: ProtocolVersion::CURRENT,
        }
    }

    /// Parses `ssh://[user@]host[?key=value&...]`.
    ///
    /// Recognized keys: `remote-program`, `remote-store`, `max-connections`,
    /// `ssh-key`, `compress`, `store`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| Error::Usage(format!("'{uri}' is not an {SCHEME}:// store URI")))?;
        let (authority, query) = rest.split_once('?').unwrap_or((rest, ""));
        let host = authority.trim_end_matches('/');
        if host.is_empty() || host.contains('/') {
            return Err(Error::Usage(format!("'{uri}' does not name a host")));
        }

        let mut config = Self::new(host);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            config = match key {
                "remote-program" => config.remote_program(value),
                "remote-store" => config.remote_store(value),
                "max-connections" => config.max_connections(value.parse().map_err(|_| {
                    Error::Usage(format!("max-connections: '{value}' is not a number"))
                })?),
                "ssh-key" => config.ssh_key(value),
                "compress" => config.compress(parse_bool(key, value)?),
                "store" => config.store_dir(StoreDir::new(value)?),
                _ => return Err(Error::Usage(format!("unknown store setting '{key}'"))),
            };
        }
        Ok(config)
    }

    /// Sets the remote program (default: `nix-store`).
    pub fn remote_program(mut self, program: impl Into<String>) -> Self {
        self.remote_program = program.into();
        self
    }

    /// Selects a non-default store on the remote.
    pub fn remote_store(mut self, store: impl Into<String>) -> Self {
        self.remote_store = Some(store.into());
        self
    }

    /// Sets the session limit (default: 1, values below 1 are raised to 1).
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n.max(1);
        self
    }

    /// Sets the ssh identity file.
    pub fn ssh_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key = Some(path.into());
        self
    }

    /// Enables ssh compression.
    pub const fn compress(mut self, on: bool) -> Self {
        self.compress = on;
        self
    }

    /// Sets the remote store directory (default: `/nix/store`).
    pub fn store_dir(mut self, dir: StoreDir) -> Self {
        self.store_dir = dir;
        self
    }

    /// Routes remote diagnostics (default: inherit this process's stderr).
    pub fn diagnostics(mut self, sink: DiagnosticSink) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Caps the protocol version offered to the remote.
    pub const fn max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = version;
        self
    }

    /// Returns the store URI.
    pub fn uri(&self) -> String {
        format!("{SCHEME}://{}", self.host)
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the remote program.
    pub fn program(&self) -> &str {
        &self.remote_program
    }

    /// Returns the remote store URI, if any.
    pub fn store(&self) -> Option<&str> {
        self.remote_store.as_deref()
    }

    /// Returns the session limit.
    pub const fn connections(&self) -> usize {
        self.max_connections
    }

    /// Returns the ssh identity file, if any.
    pub fn key(&self) -> Option<&std::path::Path> {
        self.ssh_key.as_deref()
    }

    /// Returns whether compression is requested.
    pub const fn compressed(&self) -> bool {
        self.compress
    }

    /// Returns the remote store directory.
    pub const fn dir(&self) -> &StoreDir {
        &self.store_dir
    }

    /// Returns the diagnostics destination.
    pub const fn sink(&self) -> &DiagnosticSink {
        &self.diagnostics
    }

    /// Returns the highest version offered.
    pub const fn version(&self) -> ProtocolVersion {
        self.max_version
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "" | "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(Error::Usage(format!("{key}: '{value}' is not a boolean"))),
    }
}

//! In-memory remote store used by the unit tests.
//!
//! [`MockConnector`] hands out duplex pipes whose far end is served by a
//! task speaking the server side of the protocol against a shared
//! [`Remote`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sshstore_proto::handshake::{self, ServerHello};
use sshstore_proto::{
    Command, EXPORT_MAGIC, ProtocolVersion, SERVE_MAGIC_2, nar, read_command, wire,
};
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter, DuplexStream, duplex, split};

use crate::hash::NarHash;
use crate::transport::{Connect, Transport};

/// One path held by the fake remote.
#[derive(Debug, Clone)]
struct Entry {
    /// Full deriver path or `""`.
    deriver: String,
    /// Full reference paths.
    references: Vec<String>,
    /// Archive bytes.
    nar: Vec<u8>,
    /// Signatures.
    sigs: Vec<String>,
}

/// Mutable behaviour and contents of the fake remote.
#[derive(Debug)]
struct State {
    /// Maximum version the server announces.
    version: ProtocolVersion,
    /// Greeting sent after the version.
    greeting: String,
    /// Magic word sent in reply to the client hello.
    magic: u64,
    /// Stored paths by full path.
    paths: BTreeMap<String, Entry>,
    /// Status code returned for builds.
    build_status: u64,
    /// Answer imports with "rejected".
    reject_imports: bool,
    /// Never answer a request.
    stall: bool,
    /// Answer validity queries with an impossible sequence length.
    garbage: bool,
    /// Settings words received with each build, in order.
    settings: Vec<Vec<u64>>,
    /// Targets received with the last `BuildPaths`.
    targets: Vec<String>,
    /// Transports opened.
    connections: usize,
    /// Requests received.
    commands: usize,
}

/// Shared handle to a fake remote.
#[derive(Debug, Clone)]
pub(crate) struct Remote(Arc<Mutex<State>>);

impl Default for Remote {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(State {
            version: ProtocolVersion::CURRENT,
            greeting: String::new(),
            magic: SERVE_MAGIC_2,
            paths: BTreeMap::new(),
            build_status: 0,
            reject_imports: false,
            stall: false,
            garbage: false,
            settings: Vec::new(),
            targets: Vec::new(),
            connections: 0,
            commands: 0,
        })))
    }
}

impl Remote {
    fn state(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }

    pub(crate) fn with_version(version: ProtocolVersion) -> Self {
        let remote = Self::default();
        remote.state().version = version;
        remote
    }

    pub(crate) fn connector(&self) -> MockConnector {
        MockConnector {
            remote: self.clone(),
        }
    }

    pub(crate) fn connections(&self) -> usize {
        self.state().connections
    }

    pub(crate) fn commands(&self) -> usize {
        self.state().commands
    }

    pub(crate) fn set_magic(&self, magic: u64) {
        self.state().magic = magic;
    }

    pub(crate) fn set_greeting(&self, greeting: &str) {
        greeting.clone_into(&mut self.state().greeting);
    }

    pub(crate) fn set_build_status(&self, status: u64) {
        self.state().build_status = status;
    }

    pub(crate) fn set_reject_imports(&self, on: bool) {
        self.state().reject_imports = on;
    }

    pub(crate) fn set_stall(&self, on: bool) {
        self.state().stall = on;
    }

    pub(crate) fn set_garbage(&self, on: bool) {
        self.state().garbage = on;
    }

    /// Stores a single-file path.
    pub(crate) fn add(&self, path: &str, references: &[&str], contents: &[u8]) {
        let entry = Entry {
            deriver: String::new(),
            references: references.iter().map(|r| (*r).to_owned()).collect(),
            nar: file_nar(contents),
            sigs: vec!["cache-1:c2ln".to_owned()],
        };
        self.state().paths.insert(path.to_owned(), entry);
    }

    pub(crate) fn set_deriver(&self, path: &str, deriver: &str) {
        if let Some(e) = self.state().paths.get_mut(path) {
            deriver.clone_into(&mut e.deriver);
        }
    }

    pub(crate) fn has(&self, path: &str) -> bool {
        self.state().paths.contains_key(path)
    }

    pub(crate) fn remove(&self, path: &str) {
        self.state().paths.remove(path);
    }

    pub(crate) fn settings(&self) -> Vec<Vec<u64>> {
        self.state().settings.clone()
    }

    pub(crate) fn targets(&self) -> Vec<String> {
        self.state().targets.clone()
    }
}

/// Opens duplex pipes served by a [`Remote`].
#[derive(Debug, Clone)]
pub(crate) struct MockConnector {
    /// The remote every pipe talks to.
    remote: Remote,
}

#[async_trait]
impl Connect for MockConnector {
    async fn connect(&self) -> io::Result<Transport> {
        self.remote.state().connections += 1;
        let (client, server) = duplex(64 * 1024);
        let remote = self.remote.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = serve(remote, server).await {
                tracing::debug!("mock remote: {e}");
            }
        });
        let (r, w) = split(client);
        Ok(Transport::new(r, w).with_diagnostics(task))
    }
}

/// Archive of a single regular file.
pub(crate) fn file_nar(contents: &[u8]) -> Vec<u8> {
    let tokens: [&[u8]; 7] = [b"nix-archive-1", b"(", b"type", b"regular", b"contents", contents, b")"];
    let mut buf = Vec::new();
    for token in tokens {
        buf.extend_from_slice(&(token.len() as u64).to_le_bytes());
        buf.extend_from_slice(token);
        buf.resize(buf.len() + wire::padding(token.len() as u64), 0);
    }
    buf
}

fn success(status: u64) -> bool {
    matches!(status, 0 | 1 | 2 | 13)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}

/// Server side of one connection.
async fn serve(remote: Remote, stream: DuplexStream) -> io::Result<()> {
    let (reader, writer) = split(stream);
    let mut r = BufReader::new(reader);
    let mut w = BufWriter::new(writer);

    let client = handshake::read_client_hello(&mut r).await?;
    let (magic, version, greeting) = {
        let s = remote.state();
        (s.magic, s.version, s.greeting.clone())
    };
    if magic != SERVE_MAGIC_2 {
        wire::write_u64(&mut w, magic).await?;
        return w.flush().await;
    }
    handshake::write_server_hello(&mut w, &ServerHello { version, greeting }).await?;
    let minor = client.negotiate(version).minor();

    loop {
        let cmd = match read_command(&mut r).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let (stall, garbage) = {
            let mut s = remote.state();
            s.commands += 1;
            (s.stall, s.garbage)
        };
        if stall {
            std::future::pending::<()>().await;
        }

        match cmd {
            Command::QueryValidPaths => {
                let _lock = wire::read_bool(&mut r).await?;
                let _substitute = wire::read_bool(&mut r).await?;
                let paths = wire::read_strings(&mut r).await?;
                if garbage {
                    wire::write_u64(&mut w, u64::MAX).await?;
                } else {
                    let valid: Vec<String> = {
                        let s = remote.state();
                        paths.into_iter().filter(|p| s.paths.contains_key(p)).collect()
                    };
                    wire::write_strings(&mut w, &valid).await?;
                }
            }
            Command::QueryPathInfos => {
                let paths = wire::read_strings(&mut r).await?;
                let found: Vec<(String, Entry)> = {
                    let s = remote.state();
                    paths
                        .into_iter()
                        .filter_map(|p| s.paths.get(&p).cloned().map(|e| (p, e)))
                        .collect()
                };
                for (path, e) in found {
                    wire::write_str(&mut w, &path).await?;
                    wire::write_str(&mut w, &e.deriver).await?;
                    wire::write_strings(&mut w, &e.references).await?;
                    wire::write_u64(&mut w, 0).await?;
                    wire::write_u64(&mut w, e.nar.len() as u64).await?;
                    if minor >= 4 {
                        wire::write_str(&mut w, &NarHash::digest(&e.nar).to_string()).await?;
                        wire::write_str(&mut w, "").await?;
                        wire::write_strings(&mut w, &e.sigs).await?;
                    }
                }
                wire::write_str(&mut w, "").await?;
            }
            Command::DumpStorePath => {
                let path = wire::read_string(&mut r).await?;
                let nar = remote.state().paths.get(&path).map(|e| e.nar.clone());
                w.write_all(&nar.ok_or_else(|| invalid("dump of missing path"))?).await?;
            }
            Command::ImportPaths => {
                if wire::read_u64(&mut r).await? != 1 {
                    return Err(invalid("expected one path"));
                }
                let mut nar = Vec::new();
                nar::copy(&mut r, &mut nar).await?;
                if wire::read_u64(&mut r).await? != EXPORT_MAGIC {
                    return Err(invalid("bad export magic"));
                }
                let path = wire::read_string(&mut r).await?;
                let references = wire::read_strings(&mut r).await?;
                let deriver = wire::read_string(&mut r).await?;
                let _has_signature = wire::read_u64(&mut r).await?;
                if wire::read_u64(&mut r).await? != 0 {
                    return Err(invalid("expected end of list"));
                }
                let ok = remote.import(path, references, deriver, nar, Vec::new());
                wire::write_u64(&mut w, u64::from(ok)).await?;
            }
            Command::AddToStoreNar => {
                let path = wire::read_string(&mut r).await?;
                let deriver = wire::read_string(&mut r).await?;
                let hash = wire::read_string(&mut r).await?;
                let references = wire::read_strings(&mut r).await?;
                let _registration_time = wire::read_u64(&mut r).await?;
                let size = wire::read_u64(&mut r).await?;
                let _ultimate = wire::read_bool(&mut r).await?;
                let sigs = wire::read_strings(&mut r).await?;
                let _ca = wire::read_string(&mut r).await?;
                let mut nar = Vec::new();
                nar::copy(&mut r, &mut nar).await?;
                let intact = nar.len() as u64 == size
                    && NarHash::parse(&hash).is_ok_and(|h| h == NarHash::digest(&nar));
                let ok = intact && remote.import(path, references, deriver, nar, sigs);
                wire::write_u64(&mut w, u64::from(ok)).await?;
            }
            Command::QueryClosure => {
                let _include_outputs = wire::read_bool(&mut r).await?;
                let paths = wire::read_strings(&mut r).await?;
                let closure = remote.closure(paths);
                wire::write_strings(&mut w, &closure).await?;
            }
            Command::BuildDerivation => {
                let _drv = wire::read_string(&mut r).await?;
                let mut outputs = Vec::new();
                for _ in 0..wire::read_count(&mut r).await? {
                    let name = wire::read_string(&mut r).await?;
                    let path = wire::read_string(&mut r).await?;
                    let _algo = wire::read_string(&mut r).await?;
                    let _hash = wire::read_string(&mut r).await?;
                    outputs.push((name, path));
                }
                let _inputs = wire::read_strings(&mut r).await?;
                let _platform = wire::read_string(&mut r).await?;
                let _builder = wire::read_string(&mut r).await?;
                let _args = wire::read_strings(&mut r).await?;
                for _ in 0..wire::read_count(&mut r).await? {
                    wire::read_string(&mut r).await?;
                    wire::read_string(&mut r).await?;
                }
                let settings = read_settings(&mut r, minor).await?;
                let status = {
                    let mut s = remote.state();
                    s.settings.push(settings);
                    s.build_status
                };
                if !success(status) {
                    outputs.clear();
                }

                wire::write_u64(&mut w, status).await?;
                let msg = if success(status) { "" } else { "builder failed with exit code 1" };
                wire::write_str(&mut w, msg).await?;
                if minor >= 3 {
                    wire::write_u64(&mut w, 1).await?;
                    wire::write_bool(&mut w, false).await?;
                    wire::write_u64(&mut w, 1_700_000_000).await?;
                    wire::write_u64(&mut w, 1_700_000_005).await?;
                }
                if minor >= 6 {
                    wire::write_u64(&mut w, outputs.len() as u64).await?;
                    for (name, path) in outputs {
                        let id = format!("sha256:{}!{name}", "1".repeat(64));
                        let base = path.rsplit('/').next().unwrap_or_default();
                        let doc = serde_json::json!({
                            "id": id,
                            "outPath": base,
                            "signatures": [],
                            "dependentRealisations": {},
                        });
                        wire::write_str(&mut w, &id).await?;
                        wire::write_str(&mut w, &doc.to_string()).await?;
                    }
                }
            }
            Command::BuildPaths => {
                let targets = wire::read_strings(&mut r).await?;
                let settings = read_settings(&mut r, minor).await?;
                let status = {
                    let mut s = remote.state();
                    s.settings.push(settings);
                    s.targets = targets;
                    s.build_status
                };
                wire::write_u64(&mut w, status).await?;
                if !success(status) {
                    wire::write_str(&mut w, "build of '/nix/store/...' failed").await?;
                }
            }
            Command::ExportPaths => return Err(invalid("export is not served")),
            _ => return Err(invalid("unknown command")),
        }
        w.flush().await?;
    }
}

impl Remote {
    /// Registers an imported path unless imports are being rejected.
    fn import(
        &self,
        path: String,
        references: Vec<String>,
        deriver: String,
        nar: Vec<u8>,
        sigs: Vec<String>,
    ) -> bool {
        let mut s = self.state();
        if s.reject_imports {
            return false;
        }
        s.paths.insert(
            path,
            Entry {
                deriver,
                references,
                nar,
                sigs,
            },
        );
        true
    }

    /// Forward closure over references.
    fn closure(&self, roots: Vec<String>) -> Vec<String> {
        let s = self.state();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.into();
        while let Some(p) = queue.pop_front() {
            let Some(entry) = s.paths.get(&p) else { continue };
            if seen.insert(p) {
                queue.extend(entry.references.iter().cloned());
            }
        }
        seen.into_iter().collect()
    }
}

/// Reads the build settings words the negotiated version carries.
async fn read_settings<R: AsyncRead + Unpin>(r: &mut R, minor: u64) -> io::Result<Vec<u64>> {
    let mut n = 2;
    if minor >= 2 {
        n += 1;
    }
    if minor >= 3 {
        n += 2;
    }
    if minor >= 7 {
        n += 1;
    }
    let mut words = Vec::with_capacity(n);
    for _ in 0..n {
        words.push(wire::read_u64(r).await?);
    }
    Ok(words)
}

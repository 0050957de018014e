//! The store facade.
//!
//! [`Store`] is the full operation surface a store client exposes.
//! [`SshStore`] implements it over a pool of legacy protocol sessions and
//! answers the operations that protocol cannot express with
//! [`Error::Unsupported`] without touching the network.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sshstore_proto::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::build::{BuildResult, BuildSettings, Realisation};
use crate::config::Config;
use crate::derivation::{BasicDerivation, DerivedPath};
use crate::info::PathInfo;
use crate::path::{StoreDir, StorePath};
use crate::pool::Pool;
use crate::transfer::ImportStatus;
use crate::transport::{Connect, SshConnector};
use crate::{Error, Result};

/// Whether the remote trusts this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TrustStatus {
    /// The remote trusts the client.
    Trusted,
    /// The remote does not trust the client.
    NotTrusted,
    /// The protocol cannot tell.
    Unknown,
}

/// Direction of a closure walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum ClosureDirection {
    /// Follow references (dependencies).
    #[default]
    Forward,
    /// Follow referrers (dependents).
    Reverse,
}

/// What a closure computation includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct ClosureOptions {
    /// Walk direction.
    pub direction: ClosureDirection,
    /// Include the outputs of derivations in the closure.
    pub include_outputs: bool,
    /// Include the derivers of paths in the closure.
    pub include_derivers: bool,
}

/// Read-only view of a store's file system.
pub trait FsAccessor: Send + Sync {
    /// Reads a regular file below the store directory.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Reads a symlink target below the store directory.
    fn read_link(&self, path: &Path) -> Result<String>;
}

/// Operations of a store client.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the URI identifying this store.
    fn uri(&self) -> String;

    /// Returns the remote's store directory.
    fn store_dir(&self) -> &StoreDir;

    /// Whether the remote trusts this client.
    fn is_trusted_client(&self) -> TrustStatus;

    /// Makes sure a connection can be established.
    async fn connect(&self) -> Result<()>;

    /// Returns the protocol version negotiated with the remote.
    async fn protocol_version(&self) -> Result<ProtocolVersion>;

    /// Fetches metadata; `None` if the path is unknown.
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>>;

    /// Returns the subset of `paths` that is valid.
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
        substitute: bool,
    ) -> Result<BTreeSet<StorePath>>;

    /// Computes the closure of `paths`.
    async fn compute_closure(
        &self,
        paths: &BTreeSet<StorePath>,
        options: ClosureOptions,
    ) -> Result<BTreeSet<StorePath>>;

    /// Imports one archive under the given metadata.
    async fn add_to_store(
        &self,
        info: &PathInfo,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ImportStatus>;

    /// Streams the archive of `path` into `sink`.
    async fn nar_from_path(
        &self,
        path: &StorePath,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    /// Builds a fully specified derivation.
    async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
    ) -> Result<BuildResult>;

    /// Builds or fetches a batch of targets.
    async fn build_paths(&self, targets: &[DerivedPath]) -> Result<BuildResult>;

    /// Copies a local file system path into the store.
    async fn add_path_to_store(&self, name: &str, path: &Path) -> Result<StorePath>;

    /// Adds a text file to the store.
    async fn add_text_to_store(
        &self,
        name: &str,
        text: &str,
        references: &BTreeSet<StorePath>,
    ) -> Result<StorePath>;

    /// Looks a path up by the printed digest alone.
    async fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<StorePath>>;

    /// Returns a view of the store's file system.
    fn fs_accessor(&self) -> Result<Box<dyn FsAccessor>>;

    /// Re-fetches a corrupted path.
    async fn repair_path(&self, path: &StorePath) -> Result<()>;

    /// Makes a path valid, substituting it if needed.
    async fn ensure_path(&self, path: &StorePath) -> Result<()>;

    /// Looks up where a derivation output was realised.
    async fn query_realisation(&self, id: &str) -> Result<Option<Realisation>>;
}

/// Store client speaking the legacy serve protocol.
///
/// ```no_run
/// # async fn demo() -> sshstore::Result<()> {
/// use sshstore::{Config, SshStore, Store};
///
/// let store = SshStore::open(Config::from_uri("ssh://builder?max-connections=2")?);
/// let path = store.store_dir().parse("/nix/store/b6gvzjyb2pg0kjfwrjmg1vfhh54ad73z-hello")?;
/// if let Some(info) = store.query_path_info(&path).await? {
///     println!("{} bytes", info.nar_size);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SshStore<C = SshConnector> {
    /// Settings the store was opened with.
    config: Config,
    /// Session pool.
    pool: Pool<C>,
    /// Settings sent with every build.
    build_settings: Mutex<BuildSettings>,
}

impl SshStore {
    /// Creates a store that connects lazily through `ssh`.
    pub fn open(config: Config) -> Self {
        let connector = SshConnector::new(&config);
        Self::with_connector(config, connector)
    }
}

impl<C: Connect> SshStore<C> {
    /// Creates a store that obtains transports from `connector`.
    pub fn with_connector(config: Config, connector: C) -> Self {
        let pool = Pool::new(
            connector,
            config.connections(),
            config.version(),
            config.dir().clone(),
        );
        Self {
            config,
            pool,
            build_settings: Mutex::default(),
        }
    }

    /// Returns the settings the store was opened with.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session pool.
    pub const fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Replaces the settings sent with subsequent builds.
    pub fn set_build_settings(&self, settings: BuildSettings) {
        *self.build_settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Returns the settings sent with builds.
    pub fn build_settings(&self) -> BuildSettings {
        *self.build_settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes all sessions; later operations fail with [`Error::PoolClosed`].
    pub fn close(&self) {
        self.pool.close();
    }

    /// Walks the forward closure locally using remote metadata.
    async fn walk_closure(
        &self,
        paths: &BTreeSet<StorePath>,
        options: ClosureOptions,
    ) -> Result<BTreeSet<StorePath>> {
        let mut conn = self.pool.acquire().await?;
        let mut closure = BTreeSet::new();
        let mut frontier: VecDeque<StorePath> = paths.iter().cloned().collect();
        while !frontier.is_empty() {
            let batch: BTreeSet<StorePath> = frontier
                .drain(..)
                .filter(|p| !closure.contains(p))
                .collect();
            if batch.is_empty() {
                break;
            }
            if options.include_outputs && batch.iter().any(StorePath::is_derivation) {
                return Err(Error::unsupported("queryDerivationOutputs"));
            }
            let infos = conn.query_path_infos(&batch).await?;
            for path in batch {
                let info = infos
                    .get(&path)
                    .ok_or_else(|| Error::NotFound(self.config.dir().print(&path)))?;
                frontier.extend(info.references.iter().cloned());
                if options.include_derivers {
                    frontier.extend(info.deriver.iter().cloned());
                }
                closure.insert(path);
            }
        }
        Ok(closure)
    }
}

#[async_trait]
impl<C: Connect> Store for SshStore<C> {
    fn uri(&self) -> String {
        self.config.uri()
    }

    fn store_dir(&self) -> &StoreDir {
        self.config.dir()
    }

    fn is_trusted_client(&self) -> TrustStatus {
        TrustStatus::Unknown
    }

    async fn connect(&self) -> Result<()> {
        self.pool.acquire().await.map(drop)
    }

    async fn protocol_version(&self) -> Result<ProtocolVersion> {
        Ok(self.pool.acquire().await?.version())
    }

    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>> {
        self.pool.acquire().await?.query_path_info(path).await
    }

    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
        substitute: bool,
    ) -> Result<BTreeSet<StorePath>> {
        self.pool
            .acquire()
            .await?
            .query_valid_paths(paths, substitute)
            .await
    }

    async fn compute_closure(
        &self,
        paths: &BTreeSet<StorePath>,
        options: ClosureOptions,
    ) -> Result<BTreeSet<StorePath>> {
        if options.direction == ClosureDirection::Reverse {
            return Err(Error::unsupported("queryReferrers"));
        }
        if options.include_derivers {
            return self.walk_closure(paths, options).await;
        }
        self.pool
            .acquire()
            .await?
            .query_closure(paths, options.include_outputs)
            .await
    }

    async fn add_to_store(
        &self,
        info: &PathInfo,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ImportStatus> {
        self.pool.acquire().await?.add_to_store(info, source).await
    }

    async fn nar_from_path(
        &self,
        path: &StorePath,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        self.pool.acquire().await?.nar_from_path(path, sink).await
    }

    async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
    ) -> Result<BuildResult> {
        let settings = self.build_settings();
        self.pool
            .acquire()
            .await?
            .build_derivation(drv_path, drv, &settings)
            .await
    }

    async fn build_paths(&self, targets: &[DerivedPath]) -> Result<BuildResult> {
        let settings = self.build_settings();
        self.pool.acquire().await?.build_paths(targets, &settings).await
    }

    async fn add_path_to_store(&self, _name: &str, _path: &Path) -> Result<StorePath> {
        Err(Error::unsupported("addToStore"))
    }

    async fn add_text_to_store(
        &self,
        _name: &str,
        _text: &str,
        _references: &BTreeSet<StorePath>,
    ) -> Result<StorePath> {
        Err(Error::unsupported("addTextToStore"))
    }

    async fn query_path_from_hash_part(&self, _hash_part: &str) -> Result<Option<StorePath>> {
        Err(Error::unsupported("queryPathFromHashPart"))
    }

    fn fs_accessor(&self) -> Result<Box<dyn FsAccessor>> {
        Err(Error::unsupported("getFSAccessor"))
    }

    async fn repair_path(&self, _path: &StorePath) -> Result<()> {
        Err(Error::unsupported("repairPath"))
    }

    async fn ensure_path(&self, _path: &StorePath) -> Result<()> {
        Err(Error::unsupported("ensurePath"))
    }

    async fn query_realisation(&self, _id: &str) -> Result<Option<Realisation>> {
        Err(Error::unsupported("queryRealisation"))
    }
}

//! Client for remote stores speaking the legacy `--serve` protocol over ssh.
//!
//! `sshstore` opens `ssh <host> nix-store --serve --write` sessions, keeps a
//! bounded pool of them, and exposes the operations that protocol supports
//! through the [`Store`] trait: metadata queries, closure computation,
//! archive import and export, and remote builds. Operations the protocol
//! cannot express fail with [`Error::Unsupported`] without connecting.
//!
//! # Quick start
//!
//! ```no_run
//! # async fn demo() -> sshstore::Result<()> {
//! use std::collections::BTreeSet;
//!
//! use sshstore::{ClosureOptions, Config, SshStore, Store};
//!
//! let store = SshStore::open(Config::new("builder").max_connections(4));
//! let root = store.store_dir().parse("/nix/store/b6gvzjyb2pg0kjfwrjmg1vfhh54ad73z-hello")?;
//! let closure = store
//!     .compute_closure(&BTreeSet::from([root]), ClosureOptions::default())
//!     .await?;
//! println!("{} paths", closure.len());
//! # Ok(())
//! # }
//! ```

mod build;
mod config;
mod derivation;
mod error;
mod hash;
mod info;
mod path;
mod pool;
mod session;
mod store;
#[cfg(test)]
mod testing;
mod transfer;
mod transport;

pub use build::{BuildOutcomeKind, BuildResult, BuildSettings, BuildStatus, Realisation};
pub use config::{Config, DEFAULT_REMOTE_PROGRAM, SCHEME};
pub use derivation::{BasicDerivation, DerivationOutput, DerivedPath, OutputsSpec};
pub use error::{Error, Result};
pub use hash::{NarHash, NarHasher};
pub use info::PathInfo;
pub use path::{
    DEFAULT_STORE_DIR, HASH_BYTES, HASH_CHARS, StoreDir, StorePath, nix32_decode, nix32_encode,
};
pub use pool::{Lease, Pool};
pub use session::{Session, State};
pub use sshstore_proto::ProtocolVersion;
pub use store::{ClosureDirection, ClosureOptions, FsAccessor, SshStore, Store, TrustStatus};
pub use transfer::ImportStatus;
pub use transport::{BoxReader, BoxWriter, Connect, DiagnosticSink, SshConnector, Transport};

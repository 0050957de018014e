//! Metadata queries and archive transfer on a [`Session`].
//!
//! Archives are embedded in the stream right after the frame that triggers
//! them and are not length-prefixed. Both directions go through
//! [`sshstore_proto::nar::copy`], which stops exactly at the archive's end
//! marker; any failure inside an archive leaves the stream position unknown
//! and closes the session.

use std::collections::{BTreeMap, BTreeSet};

use sshstore_proto::{Command, EXPORT_MAGIC, nar};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::hash::NarHash;
use crate::info::PathInfo;
use crate::path::StorePath;
use crate::session::Session;
use crate::{Error, Result};

/// Remote's answer to an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ImportStatus {
    /// The path is now valid on the remote.
    Accepted,
    /// The remote refused the path, e.g. for missing signatures.
    Rejected,
}

impl Session {
    /// Fetches metadata for `path`; `None` if the remote does not have it.
    pub async fn query_path_info(&mut self, path: &StorePath) -> Result<Option<PathInfo>> {
        let mut infos = self.query_path_infos(&BTreeSet::from([path.clone()])).await?;
        Ok(infos.remove(path))
    }

    /// Fetches metadata for several paths in one round trip.
    ///
    /// Paths unknown to the remote are missing from the result.
    pub async fn query_path_infos(
        &mut self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeMap<StorePath, PathInfo>> {
        let seq = self.begin(Command::QueryPathInfos)?;
        let result = self.query_path_infos_inner(paths).await;
        self.finish(seq, result)
    }

    /// Request and response of [`query_path_infos`](Self::query_path_infos).
    async fn query_path_infos_inner(
        &mut self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeMap<StorePath, PathInfo>> {
        self.send_command(Command::QueryPathInfos).await?;
        self.send_paths(paths).await?;
        self.flush().await?;

        let mut infos = BTreeMap::new();
        while let Some(path) = self.recv_opt_path().await? {
            if !paths.contains(&path) {
                return Err(Error::Protocol(format!(
                    "remote sent metadata for unrequested path '{}'",
                    self.store_dir().print(&path)
                )));
            }
            let info = self.recv_path_info(path).await?;
            infos.insert(info.path.clone(), info);
        }
        Ok(infos)
    }

    /// Reads the fields following the path of a metadata record.
    async fn recv_path_info(&mut self, path: StorePath) -> Result<PathInfo> {
        let mut info = PathInfo::new(path);
        info.deriver = self.recv_opt_path().await?;
        info.references = self.recv_paths().await?;
        let _download_size = self.recv_u64().await?;
        info.nar_size = self.recv_u64().await?;
        if self.version().minor() >= 4 {
            let hash = self.recv_string().await?;
            if !hash.is_empty() {
                info.nar_hash = Some(NarHash::parse(&hash)?);
            }
            let ca = self.recv_string().await?;
            info.content_address = (!ca.is_empty()).then_some(ca);
            info.signatures = self.recv_strings().await?.into_iter().collect();
        }
        Ok(info)
    }

    /// Returns the subset of `paths` the remote reports valid.
    ///
    /// With `substitute` the remote may first try to fetch missing paths
    /// from its own substituters. The answer is returned as-is.
    pub async fn query_valid_paths(
        &mut self,
        paths: &BTreeSet<StorePath>,
        substitute: bool,
    ) -> Result<BTreeSet<StorePath>> {
        let seq = self.begin(Command::QueryValidPaths)?;
        let result = async {
            self.send_command(Command::QueryValidPaths).await?;
            self.send_bool(false).await?;
            self.send_bool(substitute).await?;
            self.send_paths(paths).await?;
            self.flush().await?;
            self.recv_paths().await
        }
        .await;
        self.finish(seq, result)
    }

    /// Computes the forward closure of `paths` on the remote.
    pub async fn query_closure(
        &mut self,
        paths: &BTreeSet<StorePath>,
        include_outputs: bool,
    ) -> Result<BTreeSet<StorePath>> {
        let seq = self.begin(Command::QueryClosure)?;
        let result = async {
            self.send_command(Command::QueryClosure).await?;
            self.send_bool(include_outputs).await?;
            self.send_paths(paths).await?;
            self.flush().await?;
            self.recv_paths().await
        }
        .await;
        self.finish(seq, result)
    }

    /// Uploads one archive read from `source` under the metadata in `info`.
    ///
    /// Protocol 2.5 and later use `AddToStoreNar`, which requires
    /// `info.nar_hash`; older remotes get an `ImportPaths` export record.
    /// A rejection by the remote leaves the session usable; a failing
    /// `source` does not.
    pub async fn add_to_store<R>(&mut self, info: &PathInfo, source: &mut R) -> Result<ImportStatus>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let modern = self.version().minor() >= 5;
        let hash = match (modern, info.nar_hash) {
            (true, None) => {
                return Err(Error::Usage(format!(
                    "importing '{}' requires its archive hash",
                    self.store_dir().print(&info.path)
                )));
            }
            (_, hash) => hash,
        };

        let cmd = if modern { Command::AddToStoreNar } else { Command::ImportPaths };
        let seq = self.begin(cmd)?;
        let result = async {
            self.send_command(cmd).await?;
            if let Some(hash) = hash.filter(|_| modern) {
                self.send_path(&info.path).await?;
                self.send_opt_path(info.deriver.as_ref()).await?;
                self.send_str(&hash.to_hex()).await?;
                self.send_paths(&info.references).await?;
                self.send_u64(info.registration_time).await?;
                self.send_u64(info.nar_size).await?;
                self.send_bool(info.ultimate).await?;
                self.send_strings(&info.signatures).await?;
                self.send_str(info.content_address.as_deref().unwrap_or_default())
                    .await?;
                self.copy_in(source).await?;
            } else {
                self.send_u64(1).await?;
                self.copy_in(source).await?;
                self.send_u64(EXPORT_MAGIC).await?;
                self.send_path(&info.path).await?;
                self.send_paths(&info.references).await?;
                self.send_opt_path(info.deriver.as_ref()).await?;
                // No legacy signature, then end of list.
                self.send_u64(0).await?;
                self.send_u64(0).await?;
            }
            self.flush().await?;
            Ok::<_, Error>(if self.recv_u64().await? == 1 {
                ImportStatus::Accepted
            } else {
                ImportStatus::Rejected
            })
        }
        .await;
        let status = self.finish(seq, result)?;
        if status == ImportStatus::Rejected {
            tracing::warn!(
                path = %info.path,
                session = self.id(),
                "remote rejected import"
            );
        }
        Ok(status)
    }

    /// Copies one archive from `source` onto the request stream.
    async fn copy_in<R>(&mut self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let (_, writer) = self.streams();
        Ok(nar::copy(source, writer).await?)
    }

    /// Streams the archive of `path` into `sink`, returning its size.
    ///
    /// Existence is checked first on the same session, so a missing path is
    /// [`Error::NotFound`] and the session stays usable.
    pub async fn nar_from_path<W>(&mut self, path: &StorePath, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if self.query_path_info(path).await?.is_none() {
            return Err(Error::NotFound(self.store_dir().print(path)));
        }
        let seq = self.begin(Command::DumpStorePath)?;
        let result = async {
            self.send_command(Command::DumpStorePath).await?;
            self.send_path(path).await?;
            self.flush().await?;
            let (reader, _) = self.streams();
            Ok::<_, Error>(nar::copy(reader, sink).await?)
        }
        .await;
        self.finish(seq, result)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use sshstore_proto::ProtocolVersion;
    use tokio::io::ReadBuf;

    use super::*;
    use crate::path::StoreDir;
    use crate::pool::Pool;
    use crate::session::State;
    use crate::testing::{MockConnector, Remote, file_nar};

    const FOO: &str = "/nix/store/b6gvzjyb2pg0kjfwrjmg1vfhh54ad73z-foo";
    const BAR: &str = "/nix/store/7mvm4ssvd5lbi4q9n22kd5xd7b9q6dy1-bar";
    const MISSING: &str = "/nix/store/a0000000000000000000000000000000-missing";

    fn path(s: &str) -> StorePath {
        StoreDir::default().parse(s).unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<StorePath> {
        items.iter().map(|s| path(s)).collect()
    }

    fn pool(remote: &Remote) -> Pool<MockConnector> {
        Pool::new(remote.connector(), 1, ProtocolVersion::CURRENT, StoreDir::default())
    }

    /// Yields its bytes, then fails instead of reporting end of file.
    struct Broken(io::Cursor<Vec<u8>>);

    impl AsyncRead for Broken {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let cursor = &mut self.0;
            if cursor.position() >= cursor.get_ref().len() as u64 {
                return Poll::Ready(Err(io::Error::other("disk went away")));
            }
            Pin::new(cursor).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn metadata_for_known_path() {
        let remote = Remote::default();
        remote.add(BAR, &[], b"bar");
        remote.add(FOO, &[FOO, BAR], b"foo");
        remote.set_deriver(FOO, "/nix/store/0a7ybhi3x9b8z0mm1x6ib9cv6m7pmjg4-foo.drv");
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        let info = s.query_path_info(&path(FOO)).await.unwrap().unwrap();
        assert_eq!(info.references, set(&[FOO, BAR]));
        assert_eq!(info.nar_size, file_nar(b"foo").len() as u64);
        assert_eq!(info.nar_hash, Some(NarHash::digest(&file_nar(b"foo"))));
        assert!(info.deriver.unwrap().is_derivation());
        assert_eq!(info.signatures.len(), 1);

        // Asking again on the same session gives the same answer.
        let again = s.query_path_info(&path(FOO)).await.unwrap().unwrap();
        assert_eq!(again, s.query_path_info(&path(FOO)).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn unknown_path_is_absent_and_session_stays_ready() {
        let remote = Remote::default();
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        assert!(s.query_path_info(&path(MISSING)).await.unwrap().is_none());
        assert_eq!(s.state(), State::Ready);
        assert!(s.is_healthy());
    }

    #[tokio::test]
    async fn old_remotes_omit_hash_and_signatures() {
        let remote = Remote::with_version(ProtocolVersion::new(2, 3));
        remote.add(FOO, &[], b"foo");
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        let info = s.query_path_info(&path(FOO)).await.unwrap().unwrap();
        assert!(info.nar_hash.is_none());
        assert!(info.signatures.is_empty());
        assert!(s.is_healthy());
    }

    #[tokio::test]
    async fn valid_subset_and_closure() {
        let remote = Remote::default();
        remote.add(BAR, &[], b"bar");
        remote.add(FOO, &[BAR], b"foo");
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        let valid = s.query_valid_paths(&set(&[FOO, MISSING]), false).await.unwrap();
        assert_eq!(valid, set(&[FOO]));

        let closure = s.query_closure(&set(&[FOO]), false).await.unwrap();
        assert_eq!(closure, set(&[FOO, BAR]));
    }

    #[tokio::test]
    async fn export_streams_exactly_one_archive() {
        let remote = Remote::default();
        let body = vec![9u8; 200_000];
        remote.add(FOO, &[], &body);
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        let mut out = Vec::new();
        let n = s.nar_from_path(&path(FOO), &mut out).await.unwrap();
        assert_eq!(out, file_nar(&body));
        assert_eq!(n, out.len() as u64);
        // The stream is still framed correctly afterwards.
        assert!(s.query_path_info(&path(FOO)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn export_of_missing_path_is_not_found() {
        let remote = Remote::default();
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        let err = s.nar_from_path(&path(MISSING), &mut Vec::<u8>::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref p) if p == MISSING));
        assert!(s.is_healthy());
    }

    async fn export_then_import(version: ProtocolVersion) {
        let remote = Remote::with_version(version);
        remote.add(BAR, &[], b"bar");
        remote.add(FOO, &[BAR], b"foo contents");
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        let mut info = s.query_path_info(&path(FOO)).await.unwrap().unwrap();
        let mut nar = Vec::new();
        s.nar_from_path(&path(FOO), &mut nar).await.unwrap();
        remote.remove(FOO);
        assert!(s.query_valid_paths(&set(&[FOO]), false).await.unwrap().is_empty());

        info.nar_hash = Some(NarHash::digest(&nar));
        let status = s.add_to_store(&info, &mut io::Cursor::new(nar)).await.unwrap();
        assert_eq!(status, ImportStatus::Accepted);
        assert_eq!(s.query_valid_paths(&set(&[FOO]), false).await.unwrap(), set(&[FOO]));
        assert!(s.is_healthy());
    }

    #[tokio::test]
    async fn roundtrip_with_add_to_store_nar() {
        export_then_import(ProtocolVersion::CURRENT).await;
    }

    #[tokio::test]
    async fn roundtrip_with_import_paths() {
        export_then_import(ProtocolVersion::new(2, 4)).await;
    }

    #[tokio::test]
    async fn rejection_keeps_the_session() {
        let remote = Remote::default();
        remote.set_reject_imports(true);
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();

        let nar = file_nar(b"unsigned");
        let info = PathInfo::new(path(FOO)).with_nar(NarHash::digest(&nar), nar.len() as u64);
        let status = s.add_to_store(&info, &mut io::Cursor::new(nar)).await.unwrap();
        assert_eq!(status, ImportStatus::Rejected);
        assert!(s.is_healthy());
        assert!(!remote.has(FOO));
    }

    #[tokio::test]
    async fn import_requires_hash_on_new_protocol() {
        let remote = Remote::default();
        let pool = pool(&remote);
        let mut s = pool.acquire().await.unwrap();
        let before = remote.commands();

        let err = s
            .add_to_store(&PathInfo::new(path(FOO)), &mut io::Cursor::new(file_nar(b"x")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert!(s.is_healthy());
        assert_eq!(remote.commands(), before);
    }

    #[tokio::test]
    async fn failing_source_discards_the_session() {
        let remote = Remote::default();
        let pool = pool(&remote);

        let mut s = pool.acquire().await.unwrap();
        let full = file_nar(&[1u8; 4096]);
        let info = PathInfo::new(path(FOO)).with_nar(NarHash::digest(&full), full.len() as u64);
        let mut source = Broken(io::Cursor::new(full[..1000].to_vec()));
        let err = s.add_to_store(&info, &mut source).await.unwrap_err();
        assert!(err.is_connection_unusable());
        assert_eq!(s.state(), State::Closed);
        drop(s);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.in_use(), 0);

        // A replacement can still be created within capacity.
        let mut fresh = pool.acquire().await.unwrap();
        assert!(fresh.query_path_info(&path(FOO)).await.unwrap().is_none());
        assert_eq!(remote.connections(), 2);
    }

    #[tokio::test]
    async fn protocol_violation_is_never_recycled() {
        let remote = Remote::default();
        remote.set_garbage(true);
        let pool = pool(&remote);

        let mut s = pool.acquire().await.unwrap();
        let bad_id = s.id();
        let err = s.query_valid_paths(&set(&[FOO]), false).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        drop(s);
        assert_eq!(pool.idle(), 0);

        remote.set_garbage(false);
        let s = pool.acquire().await.unwrap();
        assert_ne!(s.id(), bad_id);
    }

    #[tokio::test]
    async fn abandoned_exchange_is_not_recycled() {
        let remote = Remote::default();
        remote.set_stall(true);
        let pool = pool(&remote);

        let mut s = pool.acquire().await.unwrap();
        let id = s.id();
        let res = tokio::time::timeout(
            Duration::from_millis(50),
            s.query_valid_paths(&set(&[FOO]), false),
        )
        .await;
        assert!(res.is_err());
        assert!(!s.is_healthy());
        drop(s);
        assert_eq!(pool.idle(), 0);

        remote.set_stall(false);
        let mut s = pool.acquire().await.unwrap();
        assert_ne!(s.id(), id);
        assert!(s.query_valid_paths(&set(&[FOO]), false).await.unwrap().is_empty());
    }
}

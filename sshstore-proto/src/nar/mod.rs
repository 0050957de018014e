//! Self-delimited archive (NAR) streams.
//!
//! An archive is not length-prefixed as a whole. Its end is only known by
//! parsing its token grammar:
//!
//! ```text
//! archive   := "nix-archive-1" node
//! node      := "(" "type" kind ")"
//! kind      := "regular" ["executable" ""] "contents" <bytes>
//!            | "symlink" "target" <str>
//!            | "directory" entry*
//! entry     := "entry" "(" "name" <str> "node" node ")"
//! ```
//!
//! Every token is a padded byte string (see [`crate::wire`]). [`copy`] forwards
//! exactly one archive from a reader to a writer, so the stream position after
//! it is the first byte of the next frame.

#[cfg(unix)]
mod fs;

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[cfg(unix)]
pub use fs::{dump, restore};

use crate::wire;

/// Leading token of every archive.
pub const NAR_MAGIC: &str = "nix-archive-1";

/// Upper bound for structural tokens, entry names and symlink targets.
const MAX_TOKEN_LEN: u64 = 4096;

/// Chunk size used when streaming file contents.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Forwards one archive from `r` to `w`, returning the number of bytes copied.
///
/// Fails with `InvalidData` on malformed grammar and `UnexpectedEof` if `r`
/// ends before the archive does. `w` is flushed on success.
pub async fn copy<R, W>(r: &mut R, w: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut c = Copier { r, w, copied: 0 };
    c.expect(NAR_MAGIC).await?;

    // Open directories; each directory below the root sits inside an entry.
    let mut depth = 0usize;
    loop {
        c.expect("(").await?;
        c.expect("type").await?;
        let kind = c.token().await?;
        let mut finished = match kind.as_slice() {
            b"regular" => {
                let mut tag = c.token().await?;
                if tag == b"executable" {
                    c.expect("").await?;
                    tag = c.token().await?;
                }
                if tag != b"contents" {
                    return Err(malformed("expected 'contents'", &tag));
                }
                c.contents().await?;
                c.expect(")").await?;
                true
            }
            b"symlink" => {
                c.expect("target").await?;
                c.token().await?;
                c.expect(")").await?;
                true
            }
            b"directory" => {
                depth += 1;
                false
            }
            _ => return Err(malformed("unknown node type", &kind)),
        };

        loop {
            if finished {
                if depth == 0 {
                    c.w.flush().await?;
                    return Ok(c.copied);
                }
                // Close the entry holding the node just finished.
                c.expect(")").await?;
            }
            let tag = c.token().await?;
            match tag.as_slice() {
                b"entry" => {
                    c.expect("(").await?;
                    c.expect("name").await?;
                    c.token().await?;
                    c.expect("node").await?;
                    break;
                }
                b")" => {
                    depth -= 1;
                    finished = true;
                }
                _ => return Err(malformed("expected 'entry' or ')'", &tag)),
            }
        }
    }
}

/// Streaming state for [`copy`].
struct Copier<'a, R: ?Sized, W: ?Sized> {
    /// Archive source.
    r: &'a mut R,
    /// Archive destination.
    w: &'a mut W,
    /// Bytes forwarded so far.
    copied: u64,
}

impl<R, W> Copier<'_, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    /// Forwards one structural token and returns it.
    async fn token(&mut self) -> io::Result<Vec<u8>> {
        let data = wire::read_bytes_limited(&mut *self.r, MAX_TOKEN_LEN).await?;
        wire::write_bytes(&mut *self.w, &data).await?;
        self.copied += 8 + data.len() as u64 + wire::padding(data.len() as u64) as u64;
        Ok(data)
    }

    /// Forwards one token that must equal `want`.
    async fn expect(&mut self, want: &str) -> io::Result<()> {
        let got = self.token().await?;
        if got == want.as_bytes() {
            Ok(())
        } else {
            Err(malformed(&format!("expected '{want}'"), &got))
        }
    }

    /// Streams a file body in chunks without buffering it whole.
    async fn contents(&mut self) -> io::Result<()> {
        let len = wire::read_u64(&mut *self.r).await?;
        wire::write_u64(&mut *self.w, len).await?;
        let mut remaining = len;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while remaining > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let n = remaining.min(CHUNK_SIZE as u64) as usize;
            self.r.read_exact(&mut buf[..n]).await?;
            self.w.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        wire::read_padding(&mut *self.r, len).await?;
        wire::write_padding(&mut *self.w, len).await?;
        self.copied += 8 + len + wire::padding(len) as u64;
        Ok(())
    }
}

/// Builds an `InvalidData` error naming the offending token.
fn malformed(what: &str, got: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed archive: {what}, got '{}'", String::from_utf8_lossy(got)),
    )
}

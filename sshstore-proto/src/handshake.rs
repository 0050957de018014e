//! Session opening exchange.
//!
//! ```text
//! client: SERVE_MAGIC_1  major  minor
//! server: SERVE_MAGIC_2  major  minor  greeting
//! ```
//!
//! Both sides then use `ProtocolVersion::negotiate` of the two maxima.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::version::{ProtocolVersion, SERVE_MAGIC_1, SERVE_MAGIC_2};
use crate::wire;

/// What the server sent in reply to the client hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// The server's maximum version.
    pub version: ProtocolVersion,
    /// Free-form greeting text (may be empty).
    pub greeting: String,
}

/// Writes the client hello and flushes.
pub async fn write_client_hello<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    version: ProtocolVersion,
) -> io::Result<()> {
    wire::write_u64(w, SERVE_MAGIC_1).await?;
    write_version(w, version).await?;
    w.flush().await
}

/// Reads the server hello. A wrong magic word is `InvalidData`.
pub async fn read_server_hello<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<ServerHello> {
    let magic = wire::read_u64(r).await?;
    if magic != SERVE_MAGIC_2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("protocol mismatch: expected magic {SERVE_MAGIC_2:#x}, got {magic:#x}"),
        ));
    }
    let version = read_version(r).await?;
    let greeting = wire::read_string(r).await?;
    Ok(ServerHello { version, greeting })
}

/// Reads the client hello (server side). A wrong magic word is `InvalidData`.
pub async fn read_client_hello<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
) -> io::Result<ProtocolVersion> {
    let magic = wire::read_u64(r).await?;
    if magic != SERVE_MAGIC_1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("protocol mismatch: expected magic {SERVE_MAGIC_1:#x}, got {magic:#x}"),
        ));
    }
    read_version(r).await
}

/// Writes the server hello (server side) and flushes.
pub async fn write_server_hello<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    hello: &ServerHello,
) -> io::Result<()> {
    wire::write_u64(w, SERVE_MAGIC_2).await?;
    write_version(w, hello.version).await?;
    wire::write_str(w, &hello.greeting).await?;
    w.flush().await
}

async fn write_version<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    version: ProtocolVersion,
) -> io::Result<()> {
    wire::write_u64(w, version.major()).await?;
    wire::write_u64(w, version.minor()).await
}

async fn read_version<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<ProtocolVersion> {
    let major = wire::read_u64(r).await?;
    let minor = wire::read_u64(r).await?;
    Ok(ProtocolVersion::new(major, minor))
}

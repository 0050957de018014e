//! Operation codes sent at the start of every exchange.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::wire;

/// Operation requested by the client.
///
/// The response shape is fixed by the opcode and the negotiated version; the
/// protocol is not self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Command {
    /// Filter a path set down to the paths valid on the remote.
    QueryValidPaths = 1,
    /// Fetch metadata records for a path set.
    QueryPathInfos = 2,
    /// Stream one path as a NAR.
    DumpStorePath = 3,
    /// Import paths in the export format (protocol minor < 5).
    ImportPaths = 4,
    /// Export paths in the export format.
    ExportPaths = 5,
    /// Build a batch of derived paths.
    BuildPaths = 6,
    /// Compute the reference closure of a path set.
    QueryClosure = 7,
    /// Build one fully specified derivation.
    BuildDerivation = 8,
    /// Add one path with its metadata followed by a NAR (protocol minor >= 5).
    AddToStoreNar = 9,
}

impl Command {
    /// Returns the operation name used in logs and errors.
    pub const fn name(self) -> &'static str {
        match self {
            Self::QueryValidPaths => "QueryValidPaths",
            Self::QueryPathInfos => "QueryPathInfos",
            Self::DumpStorePath => "DumpStorePath",
            Self::ImportPaths => "ImportPaths",
            Self::ExportPaths => "ExportPaths",
            Self::BuildPaths => "BuildPaths",
            Self::QueryClosure => "QueryClosure",
            Self::BuildDerivation => "BuildDerivation",
            Self::AddToStoreNar => "AddToStoreNar",
        }
    }
}

impl From<Command> for u64 {
    fn from(cmd: Command) -> Self {
        cmd as Self
    }
}

impl TryFrom<u64> for Command {
    type Error = u64;

    fn try_from(op: u64) -> Result<Self, Self::Error> {
        Ok(match op {
            1 => Self::QueryValidPaths,
            2 => Self::QueryPathInfos,
            3 => Self::DumpStorePath,
            4 => Self::ImportPaths,
            5 => Self::ExportPaths,
            6 => Self::BuildPaths,
            7 => Self::QueryClosure,
            8 => Self::BuildDerivation,
            9 => Self::AddToStoreNar,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Writes an opcode word.
pub async fn write_command<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, cmd: Command) -> io::Result<()> {
    wire::write_u64(w, cmd.into()).await
}

/// Reads an opcode word, rejecting unknown operations.
pub async fn read_command<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<Command> {
    let op = wire::read_u64(r).await?;
    Command::try_from(op)
        .map_err(|op| io::Error::new(io::ErrorKind::InvalidData, format!("unknown opcode {op}")))
}

//! Error types for store client operations.

use std::io;

/// Alias for `Result<T, sshstore::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by store client operations.
///
/// Three groups matter to callers: the connection could not be used
/// ([`is_connection_unusable`](Self::is_connection_unusable)), the remote
/// does not have the artifact ([`Error::NotFound`]), or this protocol cannot
/// perform the operation at all ([`Error::Unsupported`]).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport failed: spawn, read, write or unexpected EOF.
    #[error("connection to remote store failed: {0}")]
    Io(#[source] io::Error),

    /// The peer sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The session was closed by an earlier failure or by teardown.
    #[error("session is closed")]
    Closed,

    /// The remote does not hold the requested artifact.
    #[error("path '{0}' is not valid on the remote store")]
    NotFound(String),

    /// The legacy protocol cannot perform this operation.
    #[error("operation '{op}' is not supported by the legacy ssh store protocol")]
    Unsupported {
        /// Name of the rejected operation.
        op: &'static str,
    },

    /// A store path string could not be parsed.
    #[error("invalid store path: {0}")]
    InvalidPath(String),

    /// The caller supplied arguments the operation cannot accept.
    #[error("{0}")]
    Usage(String),

    /// The connection pool has been torn down.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl Error {
    /// Creates an [`Error::Unsupported`] for `op`.
    pub const fn unsupported(op: &'static str) -> Self {
        Self::Unsupported { op }
    }

    /// Returns `true` if the session that produced this error must be
    /// discarded.
    pub const fn is_connection_unusable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_) | Self::Closed)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::Protocol(e.to_string())
        } else {
            Self::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_data_is_a_protocol_violation() {
        let e = Error::from(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        assert!(matches!(e, Error::Protocol(_)));
        assert!(e.is_connection_unusable());

        let e = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(e, Error::Io(_)));
    }

    #[test]
    fn remote_and_local_outcomes_keep_the_connection() {
        assert!(!Error::NotFound("x".into()).is_connection_unusable());
        assert!(!Error::unsupported("ensurePath").is_connection_unusable());
        assert!(!Error::Usage("bad".into()).is_connection_unusable());
    }
}

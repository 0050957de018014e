//! Protocol constants and version negotiation.

use std::fmt;

/// Magic word sent by the client to open a session.
pub const SERVE_MAGIC_1: u64 = 0x390c_9deb;

/// Magic word the server answers with.
pub const SERVE_MAGIC_2: u64 = 0x5452_eecb;

/// Marker preceding the trailing metadata of an `ImportPaths` entry.
pub const EXPORT_MAGIC: u64 = 0x4558_494e;

/// A `(major, minor)` protocol version.
///
/// Ordering is lexicographic. Negotiation takes the component-wise minimum of
/// both peers' maximum versions, so it does not depend on which side is which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    /// Major component.
    major: u64,
    /// Minor component; gates optional fields within a major version.
    minor: u64,
}

impl ProtocolVersion {
    /// Highest version this implementation speaks.
    pub const CURRENT: Self = Self::new(2, 7);

    /// Creates a version from its components.
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Returns the major component.
    pub const fn major(self) -> u64 {
        self.major
    }

    /// Returns the minor component.
    pub const fn minor(self) -> u64 {
        self.minor
    }

    /// Returns the component-wise minimum of `self` and `peer`.
    #[must_use]
    pub fn negotiate(self, peer: Self) -> Self {
        Self {
            major: self.major.min(peer.major),
            minor: self.minor.min(peer.minor),
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

//! SHA-256 digests of archives.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::path::{nix32_decode, nix32_encode};
use crate::{Error, Result};

/// Length of a SHA-256 digest in bytes.
const SHA256_BYTES: usize = 32;

/// SHA-256 digest of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NarHash([u8; SHA256_BYTES]);

impl NarHash {
    /// Wraps raw digest bytes.
    pub const fn new(bytes: [u8; SHA256_BYTES]) -> Self {
        Self(bytes)
    }

    /// Hashes `data` in one go.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = NarHasher::default();
        hasher.update(data);
        hasher.finish().0
    }

    /// Parses `sha256:<digest>` or a bare digest, in hex or base-32.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::Protocol(format!("invalid sha256 hash '{s}'"));
        let body = match s.split_once(':') {
            Some(("sha256", body)) => body,
            Some(_) => return Err(invalid()),
            None => s,
        };
        let bytes = match body.len() {
            64 => hex_decode(body),
            52 => nix32_decode(body),
            _ => None,
        }
        .ok_or_else(invalid)?;
        bytes.try_into().map(Self).map_err(|_| invalid())
    }

    /// Returns the raw digest.
    pub const fn as_bytes(&self) -> &[u8; SHA256_BYTES] {
        &self.0
    }

    /// Lowercase hex without algorithm prefix.
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        self.0.iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

impl fmt::Display for NarHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", nix32_encode(&self.0))
    }
}

/// Incremental archive hasher that also counts bytes.
#[derive(Debug, Clone, Default)]
pub struct NarHasher {
    /// Running digest.
    sha: Sha256,
    /// Bytes hashed so far.
    size: u64,
}

impl NarHasher {
    /// Feeds more archive bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.sha.update(data);
        self.size += data.len() as u64;
    }

    /// Returns the digest and the number of bytes hashed.
    pub fn finish(self) -> (NarHash, u64) {
        let out = self.sha.finalize();
        let mut bytes = [0u8; SHA256_BYTES];
        bytes.copy_from_slice(out.as_slice());
        (NarHash(bytes), self.size)
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

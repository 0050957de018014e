//! Metadata the remote keeps about a stored path.

use std::collections::BTreeSet;

use crate::hash::NarHash;
use crate::path::StorePath;

/// Metadata describing one stored path.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PathInfo {
    /// The described path.
    pub path: StorePath,
    /// Derivation that produced the path, if known.
    pub deriver: Option<StorePath>,
    /// Paths this one refers to (may include itself).
    pub references: BTreeSet<StorePath>,
    /// Size of the serialized archive in bytes.
    pub nar_size: u64,
    /// Digest of the serialized archive (protocol 2.4 and later).
    pub nar_hash: Option<NarHash>,
    /// Content address, for content-addressed paths.
    pub content_address: Option<String>,
    /// Signatures over the path's fingerprint.
    pub signatures: BTreeSet<String>,
    /// Seconds since the epoch at which the path was registered.
    pub registration_time: u64,
    /// Whether the path was built locally rather than copied.
    pub ultimate: bool,
}

impl PathInfo {
    /// Creates an empty record for `path`.
    pub const fn new(path: StorePath) -> Self {
        Self {
            path,
            deriver: None,
            references: BTreeSet::new(),
            nar_size: 0,
            nar_hash: None,
            content_address: None,
            signatures: BTreeSet::new(),
            registration_time: 0,
            ultimate: false,
        }
    }

    /// Sets the archive digest and size.
    #[must_use]
    pub const fn with_nar(mut self, hash: NarHash, size: u64) -> Self {
        self.nar_hash = Some(hash);
        self.nar_size = size;
        self
    }

    /// Sets the deriver.
    #[must_use]
    pub fn with_deriver(mut self, deriver: StorePath) -> Self {
        self.deriver = Some(deriver);
        self
    }

    /// Adds a reference.
    #[must_use]
    pub fn with_reference(mut self, reference: StorePath) -> Self {
        self.references.insert(reference);
        self
    }

    /// Adds a signature.
    #[must_use]
    pub fn with_signature(mut self, sig: impl Into<String>) -> Self {
        self.signatures.insert(sig.into());
        self
    }
}

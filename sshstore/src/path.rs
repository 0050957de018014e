//! Store path identifiers.
//!
//! A store path is a 20-byte digest plus a human-readable name, printed as
//! `<32 base-32 chars>-<name>` and prefixed by the store directory in its
//! full form:
//!
//! - `b6gvzjyb2pg0kjfwrjmg1vfhh54ad73z-firefox-33.1`
//! - `/nix/store/b6gvzjyb2pg0kjfwrjmg1vfhh54ad73z-firefox-33.1`

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{Error, Result};

/// Digest length in bytes.
pub const HASH_BYTES: usize = 20;

/// Length of the printed digest.
pub const HASH_CHARS: usize = 32;

/// Longest allowed name.
const MAX_NAME_LEN: usize = 211;

/// Default store directory.
pub const DEFAULT_STORE_DIR: &str = "/nix/store";

/// Base-32 alphabet (no `e`, `o`, `u`, `t`).
const NIX32: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// An immutable, content-derived artifact identifier.
///
/// Equality, ordering and hashing look at the digest only.
#[derive(Debug, Clone)]
pub struct StorePath {
    /// Digest part.
    digest: [u8; HASH_BYTES],
    /// Name part.
    name: String,
}

impl StorePath {
    /// Creates a path from its digest and name.
    pub fn new(digest: [u8; HASH_BYTES], name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { digest, name })
    }

    /// Parses `<hash>-<name>` (no store directory).
    pub fn from_base_name(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPath(s.to_owned());
        if s.len() < HASH_CHARS + 2 || s.as_bytes()[HASH_CHARS] != b'-' {
            return Err(invalid());
        }
        let (hash, rest) = s.split_at(HASH_CHARS);
        let bytes = nix32_decode(hash).ok_or_else(invalid)?;
        let digest: [u8; HASH_BYTES] = bytes.try_into().map_err(|_| invalid())?;
        Self::new(digest, &rest[1..])
    }

    /// Returns the raw digest.
    pub const fn digest(&self) -> &[u8; HASH_BYTES] {
        &self.digest
    }

    /// Returns the name part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the printed digest.
    pub fn hash_part(&self) -> String {
        nix32_encode(&self.digest)
    }

    /// Returns `true` if this path names a derivation file.
    pub fn is_derivation(&self) -> bool {
        self.name.ends_with(".drv")
    }
}

impl PartialEq for StorePath {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for StorePath {}

impl Hash for StorePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl PartialOrd for StorePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digest.cmp(&other.digest)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", nix32_encode(&self.digest), self.name)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"+-._?=".contains(&b));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidPath(format!("invalid name '{name}'")))
    }
}

/// The directory under which store paths live on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir(String);

impl StoreDir {
    /// Creates a store directory; trailing slashes are dropped.
    pub fn new(dir: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        let trimmed = dir.trim_end_matches('/');
        if !trimmed.starts_with('/') {
            return Err(Error::Usage(format!(
                "store directory '{dir}' is not absolute"
            )));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the directory.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prints the full form of `path`.
    pub fn print(&self, path: &StorePath) -> String {
        format!("{}/{path}", self.0)
    }

    /// Parses a full path that must lie directly inside this directory.
    pub fn parse(&self, s: &str) -> Result<StorePath> {
        let base = s
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.contains('/'))
            .ok_or_else(|| Error::InvalidPath(format!("'{s}' is not in {}", self.0)))?;
        StorePath::from_base_name(base)
    }

    /// Parses either a full path or a bare base name.
    pub fn parse_lenient(&self, s: &str) -> Result<StorePath> {
        if s.starts_with('/') {
            self.parse(s)
        } else {
            StorePath::from_base_name(s)
        }
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        Self(DEFAULT_STORE_DIR.to_owned())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encodes bytes in the store's base-32 variant (least significant first,
/// printed most significant first).
pub fn nix32_encode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let len = (bytes.len() * 8 - 1) / 5 + 1;
    let mut out = String::with_capacity(len);
    for n in (0..len).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let lo = u16::from(bytes[i]) >> j;
        let hi = bytes.get(i + 1).map_or(0, |&next| u16::from(next) << (8 - j));
        out.push(char::from(NIX32[usize::from((lo | hi) & 0x1f)]));
    }
    out
}

/// Decodes the store's base-32 variant; `None` on bad characters or overflow.
#[allow(clippy::cast_possible_truncation)]
pub fn nix32_decode(s: &str) -> Option<Vec<u8>> {
    let len = s.len() * 5 / 8;
    let mut out = vec![0u8; len];
    for (n, c) in s.bytes().rev().enumerate() {
        let digit = NIX32.iter().position(|&a| a == c)? as u16;
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let shifted = digit << j;
        *out.get_mut(i)? |= shifted as u8;
        let carry = shifted >> 8;
        if carry != 0 {
            *out.get_mut(i + 1)? |= carry as u8;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "b6gvzjyb2pg0kjfwrjmg1vfhh54ad73z-firefox-33.1";

    #[test]
    fn parse_and_print_base_name() {
        let p = StorePath::from_base_name(SAMPLE).unwrap();
        assert_eq!(p.name(), "firefox-33.1");
        assert_eq!(p.hash_part(), "b6gvzjyb2pg0kjfwrjmg1vfhh54ad73z");
        assert_eq!(p.to_string(), SAMPLE);
    }

    #[test]
    fn full_path_roundtrip() {
        let dir = StoreDir::default();
        let full = format!("/nix/store/{SAMPLE}");
        let p = dir.parse(&full).unwrap();
        assert_eq!(dir.print(&p), full);
        assert!(dir.parse(&format!("/other/{SAMPLE}")).is_err());
        assert!(dir.parse(&format!("/nix/store/{SAMPLE}/bin")).is_err());
    }

    #[test]
    fn equality_is_digest_equality() {
        let a = StorePath::new([1; HASH_BYTES], "a").unwrap();
        let b = StorePath::new([1; HASH_BYTES], "b").unwrap();
        let c = StorePath::new([2; HASH_BYTES], "a").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_bad_names_and_hashes() {
        assert!(StorePath::new([0; HASH_BYTES], "").is_err());
        assert!(StorePath::new([0; HASH_BYTES], ".hidden").is_err());
        assert!(StorePath::new([0; HASH_BYTES], "a/b").is_err());
        assert!(StorePath::new([0; HASH_BYTES], "x".repeat(212)).is_err());
        // 'e' is not in the alphabet
        assert!(StorePath::from_base_name("e6gvzjyb2pg0kjfwrjmg1vfhh54ad73z-x").is_err());
        assert!(StorePath::from_base_name("short-x").is_err());
    }

    #[test]
    fn nix32_roundtrip() {
        let bytes: Vec<u8> = (0u8..32).map(|i| i.wrapping_mul(37)).collect();
        let s = nix32_encode(&bytes);
        assert_eq!(s.len(), 52);
        assert_eq!(nix32_decode(&s).unwrap(), bytes);

        let digest = [0xffu8; HASH_BYTES];
        let s = nix32_encode(&digest);
        assert_eq!(s.len(), HASH_CHARS);
        assert_eq!(nix32_decode(&s).unwrap(), digest);
    }

    #[test]
    fn store_dir_must_be_absolute() {
        assert!(StoreDir::new("relative/store").is_err());
        assert_eq!(StoreDir::new("/gnu/store/").unwrap().as_str(), "/gnu/store");
    }
}

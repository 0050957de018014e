//! Wire protocol for the legacy `--serve` store protocol.
//!
//! Every frame is built from little-endian `u64` words and word-padded byte
//! strings (see [`wire`]). A session opens with the magic/version exchange in
//! [`handshake`], then carries one [`Command`] exchange at a time. Archive
//! payloads travel as self-delimited NAR streams (see [`nar`]) embedded
//! directly after the frame that triggers them.

mod command;
pub mod handshake;
pub mod nar;
mod version;
pub mod wire;

pub use command::{Command, read_command, write_command};
pub use version::{EXPORT_MAGIC, ProtocolVersion, SERVE_MAGIC_1, SERVE_MAGIC_2};

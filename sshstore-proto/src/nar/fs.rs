//! Conversion between filesystem trees and archives.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;

use super::{MAX_TOKEN_LEN, NAR_MAGIC};
use crate::wire::padding;

/// Serializes the tree at `path` as an archive into `w`.
///
/// Directory entries are emitted in byte order of their names. Only the
/// executable bit of regular files is preserved.
pub fn dump(path: &Path, w: &mut impl Write) -> io::Result<()> {
    put(w, NAR_MAGIC.as_bytes())?;
    dump_node(path, w)
}

fn dump_node(path: &Path, w: &mut impl Write) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    put_all(w, &[b"(", b"type"])?;
    let ft = meta.file_type();
    if ft.is_file() {
        put(w, b"regular")?;
        if meta.permissions().mode() & 0o111 != 0 {
            put_all(w, &[b"executable", b""])?;
        }
        put(w, b"contents")?;
        let len = meta.len();
        w.write_all(&len.to_le_bytes())?;
        let copied = io::copy(&mut File::open(path)?.take(len), w)?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while archiving", path.display()),
            ));
        }
        w.write_all(&[0; 8][..padding(len)])?;
    } else if ft.is_symlink() {
        put_all(w, &[b"symlink", b"target"])?;
        put(w, fs::read_link(path)?.as_os_str().as_bytes())?;
    } else if ft.is_dir() {
        put(w, b"directory")?;
        let mut names = fs::read_dir(path)?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        for name in names {
            put_all(w, &[b"entry", b"(", b"name"])?;
            put(w, name.as_bytes())?;
            put(w, b"node")?;
            dump_node(&path.join(&name), w)?;
            put(w, b")")?;
        }
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{}: unsupported file type", path.display()),
        ));
    }
    put(w, b")")
}

/// Materializes an archive read from `r` at `dest`, which must not exist.
///
/// Entry names must be non-empty, must not be `.` or `..` and must not
/// contain `/` or NUL. Entries must be strictly sorted.
pub fn restore(r: &mut impl Read, dest: &Path) -> io::Result<()> {
    expect(r, NAR_MAGIC.as_bytes())?;
    restore_node(r, dest)
}

fn restore_node(r: &mut impl Read, dest: &Path) -> io::Result<()> {
    expect(r, b"(")?;
    expect(r, b"type")?;
    let kind = take(r, MAX_TOKEN_LEN)?;
    match kind.as_slice() {
        b"regular" => {
            let mut tag = take(r, MAX_TOKEN_LEN)?;
            let executable = tag == b"executable";
            if executable {
                expect(r, b"")?;
                tag = take(r, MAX_TOKEN_LEN)?;
            }
            if tag != b"contents" {
                return Err(invalid("expected 'contents'"));
            }
            let len = read_u64(r)?;
            let mut file = fs::OpenOptions::new().write(true).create_new(true).open(dest)?;
            let copied = io::copy(&mut r.by_ref().take(len), &mut file)?;
            if copied != len {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            skip_padding(r, len)?;
            let mode = if executable { 0o555 } else { 0o444 };
            file.set_permissions(fs::Permissions::from_mode(mode))?;
        }
        b"symlink" => {
            expect(r, b"target")?;
            let target = take(r, MAX_TOKEN_LEN)?;
            symlink(OsStr::from_bytes(&target), dest)?;
        }
        b"directory" => {
            fs::create_dir(dest)?;
            let mut prev: Option<Vec<u8>> = None;
            loop {
                let tag = take(r, MAX_TOKEN_LEN)?;
                match tag.as_slice() {
                    b")" => return Ok(()),
                    b"entry" => {}
                    _ => return Err(invalid("expected 'entry' or ')'")),
                }
                expect(r, b"(")?;
                expect(r, b"name")?;
                let name = take(r, MAX_TOKEN_LEN)?;
                check_name(&name)?;
                if prev.as_ref().is_some_and(|p| p.as_slice() >= name.as_slice()) {
                    return Err(invalid("directory entries out of order"));
                }
                expect(r, b"node")?;
                restore_node(r, &dest.join(OsStr::from_bytes(&name)))?;
                expect(r, b")")?;
                prev = Some(name);
            }
        }
        _ => return Err(invalid("unknown node type")),
    }
    expect(r, b")")
}

/// Rejects names that would escape or alias the parent directory.
fn check_name(name: &[u8]) -> io::Result<()> {
    if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') || name.contains(&0)
    {
        return Err(invalid(&format!(
            "invalid entry name '{}'",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

fn put(w: &mut impl Write, token: &[u8]) -> io::Result<()> {
    let len = token.len() as u64;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(token)?;
    w.write_all(&[0; 8][..padding(len)])
}

fn put_all(w: &mut impl Write, tokens: &[&[u8]]) -> io::Result<()> {
    tokens.iter().try_for_each(|t| put(w, t))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn take(r: &mut impl Read, max: u64) -> io::Result<Vec<u8>> {
    let len = read_u64(r)?;
    if len > max {
        return Err(invalid("token too long"));
    }
    #[allow(clippy::cast_possible_truncation)]
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    skip_padding(r, len)?;
    Ok(buf)
}

fn expect(r: &mut impl Read, want: &[u8]) -> io::Result<()> {
    if take(r, MAX_TOKEN_LEN)? == want {
        Ok(())
    } else {
        Err(invalid(&format!("expected '{}'", String::from_utf8_lossy(want))))
    }
}

fn skip_padding(r: &mut impl Read, len: u64) -> io::Result<()> {
    let mut buf = [0u8; 8];
    let pad = padding(len);
    r.read_exact(&mut buf[..pad])?;
    if buf[..pad].iter().any(|&b| b != 0) {
        return Err(invalid("non-zero padding"));
    }
    Ok(())
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed archive: {msg}"))
}

//! Primitive encoding over any `AsyncRead`/`AsyncWrite` stream.
//!
//! - integers: one little-endian `u64` word
//! - booleans: a word holding `0` or `1`
//! - byte strings: a length word, the bytes, then zero padding up to the
//!   next multiple of 8
//! - sequences: a count word followed by the elements

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted byte-string length (16 MiB).
pub const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Maximum accepted element count of a sequence.
pub const MAX_SEQUENCE_LEN: u64 = 1 << 20;

/// Zero bytes used for padding.
const ZEROS: [u8; 8] = [0; 8];

/// Returns the number of padding bytes following a string of `len` bytes.
#[allow(clippy::cast_possible_truncation)]
pub const fn padding(len: u64) -> usize {
    ((8 - len % 8) % 8) as usize
}

/// Writes one word.
pub async fn write_u64<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, n: u64) -> io::Result<()> {
    w.write_all(&n.to_le_bytes()).await
}

/// Writes a boolean word.
pub async fn write_bool<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, b: bool) -> io::Result<()> {
    write_u64(w, u64::from(b)).await
}

/// Writes a length-prefixed, padded byte string.
pub async fn write_bytes<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u64::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string exceeds u64::MAX"))?;
    write_u64(w, len).await?;
    w.write_all(data).await?;
    write_padding(w, len).await
}

/// Writes a UTF-8 string.
pub async fn write_str<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes()).await
}

/// Writes a sequence of strings.
pub async fn write_strings<W, I>(w: &mut W, items: I) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    I: IntoIterator,
    I::IntoIter: ExactSizeIterator,
    I::Item: AsRef<str>,
{
    let items = items.into_iter();
    write_u64(w, items.len() as u64).await?;
    for item in items {
        write_str(w, item.as_ref()).await?;
    }
    Ok(())
}

/// Writes the zero padding that follows a string of `len` bytes.
pub async fn write_padding<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, len: u64) -> io::Result<()> {
    let pad = padding(len);
    if pad > 0 {
        w.write_all(&ZEROS[..pad]).await?;
    }
    Ok(())
}

/// Reads one word.
pub async fn read_u64<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads a boolean word. Any non-zero value is `true`.
pub async fn read_bool<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<bool> {
    Ok(read_u64(r).await? != 0)
}

/// Reads a sequence count, rejecting counts above [`MAX_SEQUENCE_LEN`].
pub async fn read_count<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<usize> {
    let n = read_u64(r).await?;
    if n > MAX_SEQUENCE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("sequence of {n} elements exceeds limit"),
        ));
    }
    usize::try_from(n).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "count overflow"))
}

/// Reads a byte string of at most `max` bytes and checks its padding.
pub async fn read_bytes_limited<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    max: u64,
) -> io::Result<Vec<u8>> {
    let len = read_u64(r).await?;
    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string of {len} bytes exceeds {max} byte limit"),
        ));
    }
    let size =
        usize::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length overflow"))?;
    let mut data = vec![0u8; size];
    r.read_exact(&mut data).await?;
    read_padding(r, len).await?;
    Ok(data)
}

/// Reads a byte string of at most [`MAX_STRING_LEN`] bytes.
pub async fn read_bytes<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<Vec<u8>> {
    read_bytes_limited(r, MAX_STRING_LEN).await
}

/// Reads a UTF-8 string.
pub async fn read_string<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<String> {
    String::from_utf8(read_bytes(r).await?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Reads a sequence of strings.
pub async fn read_strings<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<Vec<String>> {
    let n = read_count(r).await?;
    let mut out = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        out.push(read_string(r).await?);
    }
    Ok(out)
}

/// Consumes the padding after a string of `len` bytes; padding must be zero.
pub async fn read_padding<R: AsyncRead + Unpin + ?Sized>(r: &mut R, len: u64) -> io::Result<()> {
    let pad = padding(len);
    if pad > 0 {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf[..pad]).await?;
        if buf[..pad].iter().any(|&b| b != 0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "non-zero string padding",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strings_are_word_padded() {
        let mut buf = Vec::new();
        write_str(&mut buf, "abc").await.unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..8], &3u64.to_le_bytes());
        assert_eq!(&buf[8..11], b"abc");
        assert_eq!(&buf[11..], &[0; 5]);

        let mut cursor = io::Cursor::new(buf);
        assert_eq!(read_string(&mut cursor).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn empty_and_aligned_strings_have_no_padding() {
        let mut buf = Vec::new();
        write_str(&mut buf, "").await.unwrap();
        write_str(&mut buf, "12345678").await.unwrap();
        assert_eq!(buf.len(), 8 + 16);
    }

    #[tokio::test]
    async fn rejects_dirty_padding() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 1).await.unwrap();
        buf.extend_from_slice(b"x\0\0\x01\0\0\0\0");
        let err = read_string(&mut io::Cursor::new(buf)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_oversized_string() {
        let header = (MAX_STRING_LEN + 1).to_le_bytes();
        let err = read_bytes(&mut io::Cursor::new(&header[..])).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_oversized_sequence() {
        let header = (MAX_SEQUENCE_LEN + 1).to_le_bytes();
        let err = read_strings(&mut io::Cursor::new(&header[..])).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn string_sequence() {
        let mut buf = Vec::new();
        write_strings(&mut buf, ["a", "bb", "ccc"]).await.unwrap();
        let items = read_strings(&mut io::Cursor::new(buf)).await.unwrap();
        assert_eq!(items, vec!["a", "bb", "ccc"]);
    }

    #[tokio::test]
    async fn bool_accepts_any_non_zero() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 7).await.unwrap();
        write_bool(&mut buf, false).await.unwrap();
        let mut cursor = io::Cursor::new(buf);
        assert!(read_bool(&mut cursor).await.unwrap());
        assert!(!read_bool(&mut cursor).await.unwrap());
    }
}

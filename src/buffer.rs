//! Append-only byte buffer with line / delimiter / byte-count consumption
//! primitives (spec §3, §4.1).
//!
//! Single-owner, never shared across transfers: each [`Transfer`](crate::transfer::Transfer)
//! owns exactly one `StreamBuffer`, and every byte observed on the wire is
//! appended to it before any user hook runs.

use bytes::{Buf, BytesMut};

/// An opaque mutable byte sequence. All `consume_*` operations are
/// destructive; `peek` is not.
#[derive(Debug, Default, Clone)]
pub struct StreamBuffer {
    inner: BytesMut,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.inner.extend_from_slice(bytes);
    }

    /// Non-consuming view of the full buffer contents.
    pub fn peek(&self) -> &[u8] {
        &self.inner
    }

    /// Drain and return the entire buffer.
    pub fn consume_all(&mut self) -> Vec<u8> {
        let drained = self.inner.split();
        drained.to_vec()
    }

    /// Consume up to and including the first `\n`, stripping one trailing
    /// `\r` if present. Returns `None` (leaving the buffer untouched) if no
    /// `\n` exists yet.
    pub fn consume_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.inner.iter().position(|&b| b == b'\n')?;
        let mut line = self.inner.split_to(pos);
        self.inner.advance(1); // drop the '\n'
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.to_vec())
    }

    /// Consume up to the delimiter. If `include_delim` is true the returned
    /// bytes include the delimiter; either way the buffer always advances
    /// past it. Returns `None` if the delimiter is not yet present.
    pub fn consume_until(&mut self, delim: &[u8], include_delim: bool) -> Option<Vec<u8>> {
        let pos = find_subslice(&self.inner, delim)?;
        let take = if include_delim { pos + delim.len() } else { pos };
        let chunk = self.inner.split_to(take);
        if !include_delim {
            self.inner.advance(delim.len());
        }
        Some(chunk.to_vec())
    }

    /// Consume exactly `n` bytes. Panics if fewer than `n` bytes are
    /// buffered — callers are expected to check [`StreamBuffer::len`] first.
    pub fn consume_bytes(&mut self, n: usize) -> Vec<u8> {
        self.inner.split_to(n).to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_line_strips_trailing_cr() {
        let mut buf = StreamBuffer::new();
        buf.append(b"hello\r\nworld");
        assert_eq!(buf.consume_line().unwrap(), b"hello".to_vec());
        assert_eq!(buf.peek(), b"world");
    }

    #[test]
    fn consume_line_without_newline_is_noop() {
        let mut buf = StreamBuffer::new();
        buf.append(b"no newline here");
        assert!(buf.consume_line().is_none());
        assert_eq!(buf.len(), "no newline here".len());
    }

    #[test]
    fn consume_until_include_and_exclude() {
        let mut buf = StreamBuffer::new();
        buf.append(b"event: message\n\ndata: x");
        let without = buf.consume_until(b"\n\n", false).unwrap();
        assert_eq!(without, b"event: message");
        assert_eq!(buf.peek(), b"data: x");

        let mut buf2 = StreamBuffer::new();
        buf2.append(b"a,b,c");
        let with = buf2.consume_until(b",", true).unwrap();
        assert_eq!(with, b"a,");
        assert_eq!(buf2.peek(), b"b,c");
    }

    #[test]
    fn consume_bytes_and_all() {
        let mut buf = StreamBuffer::new();
        buf.append(b"0123456789");
        assert_eq!(buf.consume_bytes(3), b"012".to_vec());
        assert_eq!(buf.consume_all(), b"3456789".to_vec());
        assert!(buf.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buf = StreamBuffer::new();
        buf.append(b"abc");
        assert_eq!(buf.peek(), b"abc");
        assert_eq!(buf.len(), 3);
    }
}

//! Cursor byte stream over received network chunks.
//!
//! The reader loop appends whatever the socket produced; the parsers consume
//! through a cursor without copying. `trim_consumed` drops the consumed
//! prefix once a frame boundary is reached so the buffer stays small on
//! long-lived connections.

use bytes::BytesMut;

use crate::{
    INT_LEN,
    errors::{ProtocolError, Result},
};

/// Append-only byte buffer with a read cursor.
///
/// Reads never remove data; they only advance the cursor. Callers decide
/// when consumed bytes are actually released via [`ByteStream::trim_consumed`],
/// which keeps partially parsed frames rewindable until they are complete.
#[derive(Debug, Default)]
pub struct ByteStream {
    buf: BytesMut,
    cursor: usize,
}

impl ByteStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream seeded with `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { buf: BytesMut::from(bytes), cursor: 0 }
    }

    /// Append a chunk to the end of the stream.
    pub fn append(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Total bytes held, consumed or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the stream holds no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes not yet consumed by the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Whether the cursor has reached the end of the buffered data.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Consume and return the next `n` bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Truncated` if fewer than `n` bytes remain. The
    ///   cursor is left unchanged so the caller can retry after appending.
    pub fn next_bytes(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated { expected: n, available: self.remaining() });
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.buf[start..self.cursor])
    }

    /// Consume a 4-byte big-endian signed integer.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Truncated` if fewer than four bytes remain.
    pub fn next_int(&mut self) -> Result<i32> {
        let bytes = self.next_bytes(INT_LEN)?;
        // next_bytes guarantees exactly INT_LEN bytes
        let mut arr = [0u8; INT_LEN];
        arr.copy_from_slice(bytes);
        Ok(i32::from_be_bytes(arr))
    }

    /// Consume an `n`-byte big-endian unsigned integer (`n` ≤ 8).
    ///
    /// Used for the 3-byte tag fields and 4-byte length prefixes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Truncated` if fewer than `n` bytes remain.
    pub fn next_uint(&mut self, n: usize) -> Result<u64> {
        debug_assert!(n <= 8);
        let bytes = self.next_bytes(n)?;
        let mut value = 0u64;
        for byte in bytes {
            value = (value << 8) | u64::from(*byte);
        }
        Ok(value)
    }

    /// Consume and return every remaining byte.
    pub fn next_all_bytes(&mut self) -> &[u8] {
        let start = self.cursor;
        self.cursor = self.buf.len();
        &self.buf[start..]
    }

    /// Drop every byte before the cursor and rebase the cursor to zero.
    pub fn trim_consumed(&mut self) {
        if self.cursor > 0 {
            let _ = self.buf.split_to(self.cursor);
            self.cursor = 0;
        }
    }

    /// Rewind the cursor to the start of the retained bytes.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads_advance_cursor() {
        let mut stream = ByteStream::from_bytes(b"abcdef");

        assert_eq!(stream.next_bytes(2).unwrap(), b"ab");
        assert_eq!(stream.next_bytes(3).unwrap(), b"cde");
        assert_eq!(stream.remaining(), 1);
        assert_eq!(stream.next_bytes(1).unwrap(), b"f");
        assert!(stream.is_exhausted());
    }

    #[test]
    fn read_past_end_is_truncated_and_retryable() {
        let mut stream = ByteStream::from_bytes(b"ab");

        assert_eq!(
            stream.next_bytes(3),
            Err(ProtocolError::Truncated { expected: 3, available: 2 })
        );

        // Cursor unchanged: appending makes the read succeed.
        stream.append(b"c");
        assert_eq!(stream.next_bytes(3).unwrap(), b"abc");
    }

    #[test]
    fn next_int_round_trip() {
        let mut stream = ByteStream::from_bytes(&(-7i32).to_be_bytes());
        assert_eq!(stream.next_int().unwrap(), -7);

        let mut stream = ByteStream::from_bytes(&i32::MAX.to_be_bytes());
        assert_eq!(stream.next_int().unwrap(), i32::MAX);
    }

    #[test]
    fn next_uint_reads_three_byte_tags() {
        let mut stream = ByteStream::from_bytes(&[0x00, 0x01, 0x04]);
        assert_eq!(stream.next_uint(3).unwrap(), 0x104);
    }

    #[test]
    fn trim_consumed_keeps_unread_suffix() {
        let mut stream = ByteStream::from_bytes(b"abcdef");
        stream.next_bytes(4).unwrap();

        stream.trim_consumed();
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.remaining(), 2);
        assert_eq!(stream.next_bytes(2).unwrap(), b"ef");
    }

    #[test]
    fn append_after_trim() {
        let mut stream = ByteStream::from_bytes(b"xy");
        stream.next_bytes(2).unwrap();
        stream.trim_consumed();

        stream.append(b"z");
        assert_eq!(stream.next_all_bytes(), b"z");
    }
}

#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A fixed-capacity byte ring holding NUL-delimited records.
//!
//! The ring is not a generic concurrent data structure: it assumes a
//! single writer and a single reader sharing the same owner (the event
//! loop calls both `append` and `drain_to` itself). There is no
//! internal locking. When free space is insufficient for a new record,
//! the oldest records are evicted one at a time until there is room;
//! a record larger than the ring's capacity is rejected outright and
//! the ring is left unchanged.

use std::io::{self, Write};

/// Errors produced by [`RingBuffer`] operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The record, plus its delimiter, does not fit even in an empty
    /// ring of this capacity.
    #[error("record of {len} bytes (+1 delimiter) exceeds ring capacity of {capacity} bytes")]
    TooLarge {
        /// Length of the rejected record, in bytes.
        len: usize,
        /// Capacity of the ring, in bytes.
        capacity: usize,
    },

    /// There are no complete records to drain.
    #[error("ring buffer is empty")]
    Empty,

    /// The ring's internal delimiter invariant was violated: a tail
    /// segment wrapped without containing a NUL. This indicates a bug
    /// in the writer, not a caller error, and is not expected to be
    /// recoverable.
    #[error("ring buffer corrupted: record does not terminate within capacity")]
    Corrupt,

    /// Writing drained bytes to the destination failed.
    #[error("failed to write drained record: {0}")]
    Io(#[from] io::Error),
}

/// A fixed-capacity ring of NUL-delimited byte records.
///
/// Invariants (checked by the test suite, not at runtime in release
/// builds): `len <= capacity`; `write` and `read` are always in
/// `[0, capacity)`; the bytes currently held form an integral number of
/// complete records separated by single NUL bytes.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    len: usize,
    write: usize,
    read: usize,
}

impl RingBuffer {
    /// Creates a new ring with the given capacity, in bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            len: 0,
            write: 0,
            read: 0,
        }
    }

    /// Number of bytes currently held (records plus their delimiters).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Total capacity of the ring, in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if no complete record is currently held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `record` to the ring, evicting the oldest records if
    /// necessary to make room.
    ///
    /// Returns [`Error::TooLarge`] (leaving the ring unchanged) if
    /// `record.len() + 1` exceeds the ring's capacity.
    pub fn append(&mut self, record: &[u8]) -> Result<(), Error> {
        let needed = record.len() + 1;
        let capacity = self.capacity();
        if needed > capacity {
            return Err(Error::TooLarge {
                len: record.len(),
                capacity,
            });
        }

        while needed > capacity - self.len {
            self.drain_one()?;
        }

        let n = copy_into(&mut self.buf[self.write..], record);
        if n < record.len() {
            let copied = copy_into(&mut self.buf[..], &record[n..]);
            self.write = copied;
        } else {
            self.write = (self.write + n) % capacity;
        }
        self.buf[self.write] = 0;
        self.write = (self.write + 1) % capacity;
        self.len += needed;
        Ok(())
    }

    /// Drains the oldest record into `writer`, advancing past its
    /// delimiter. Returns [`Error::Empty`] if the ring holds nothing.
    pub fn drain_to<W: Write>(&mut self, writer: &mut W) -> Result<usize, Error> {
        if self.len == 0 {
            return Err(Error::Empty);
        }

        let capacity = self.capacity();
        let mut written = 0usize;
        loop {
            let tailcap = capacity - self.read;
            let taillen = tailcap.min(self.len);
            let tail_start = self.read;
            let tail_end = tail_start + taillen;
            let delimiter = self.buf[tail_start..tail_end].iter().position(|&b| b == 0);

            match delimiter {
                Some(end) => {
                    writer.write_all(&self.buf[tail_start..tail_start + end])?;
                    written += end;
                    self.read = (self.read + end + 1) % capacity;
                    self.len -= end + 1;
                    return Ok(written);
                }
                None => {
                    if taillen < tailcap {
                        // The tail segment was shorter than the physical
                        // space remaining, so a delimiter must have been
                        // present, or len was miscounted.
                        return Err(Error::Corrupt);
                    }
                    writer.write_all(&self.buf[tail_start..tail_end])?;
                    written += taillen;
                    self.read = 0;
                    self.len -= taillen;
                }
            }
        }
    }

    /// Drains and discards the oldest record. Used internally to evict
    /// space for a new, larger record.
    pub fn drain_one(&mut self) -> Result<usize, Error> {
        self.drain_to(&mut io::sink())
    }
}

fn copy_into(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain_all(ring: &mut RingBuffer) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        loop {
            let mut out = Vec::new();
            match ring.drain_to(&mut out) {
                Ok(_) => records.push(out),
                Err(Error::Empty) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        records
    }

    #[test]
    fn round_trip_fifo_order() {
        let mut ring = RingBuffer::new(1024);
        ring.append(b"one").unwrap();
        ring.append(b"two").unwrap();
        ring.append(b"three").unwrap();

        let records = drain_all(&mut ring);
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert!(ring.is_empty());
    }

    #[test]
    fn exact_capacity_minus_one_succeeds() {
        let cap = 64;
        let mut ring = RingBuffer::new(cap);
        let record = vec![b'x'; cap - 1];
        ring.append(&record).unwrap();
        assert_eq!(ring.len(), cap);

        let mut out = Vec::new();
        ring.drain_to(&mut out).unwrap();
        assert_eq!(out, record);
    }

    #[test]
    fn record_of_capacity_is_rejected() {
        let cap = 64;
        let mut ring = RingBuffer::new(cap);
        let record = vec![b'x'; cap];
        let err = ring.append(&record).unwrap_err();
        assert!(matches!(err, Error::TooLarge { .. }));
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn eviction_keeps_last_two_records_in_order() {
        // 300-byte ring, ~140-byte records (139 payload + 1 delimiter = 140).
        let mut ring = RingBuffer::new(300);
        let record = vec![b'a'; 139];
        for _ in 0..100 {
            ring.append(&record).unwrap();
        }

        let records = drain_all(&mut ring);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record);
        assert_eq!(records[1], record);
    }

    #[test]
    fn wrap_around_preserves_record_bytes() {
        let mut ring = RingBuffer::new(32);
        // Force the write cursor to wrap mid-record.
        ring.append(b"abcdefghij").unwrap(); // 11 bytes incl delim, write=11
        let mut scratch = Vec::new();
        ring.drain_to(&mut scratch).unwrap(); // read=11, len=0
        scratch.clear();

        ring.append(b"0123456789012345678901234").unwrap(); // 26 bytes, wraps past 32
        ring.drain_to(&mut scratch).unwrap();
        assert_eq!(scratch, b"0123456789012345678901234".to_vec());
    }

    #[test]
    fn drain_on_empty_ring_returns_empty_error() {
        let mut ring = RingBuffer::new(16);
        let mut out = Vec::new();
        assert!(matches!(ring.drain_to(&mut out), Err(Error::Empty)));
    }

    #[test]
    fn len_never_exceeds_capacity_under_repeated_overload() {
        let mut ring = RingBuffer::new(500);
        for i in 0..1000u32 {
            let payload = format!("record-{i}");
            ring.append(payload.as_bytes()).unwrap();
            assert!(ring.len() <= ring.capacity());
        }
    }
}

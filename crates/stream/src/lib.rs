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

//! The compressing NDJSON stream written by the event loop and read,
//! chunk by chunk, by the transport task sending the HTTP request
//! body.
//!
//! Writes never produce compressed bytes synchronously with the
//! network: the writer side just feeds `deflate`, which buffers
//! internally until [`Stream::flush`] or [`Stream::close`] force a
//! sync point. The reader side is a request/response channel rather
//! than a plain byte source: the transport task sends a
//! [`ChunkRequest`] and awaits its reply, so that the event loop
//! decides exactly when bytes become available and can multiplex that
//! decision into its central select alongside every other input.

use std::io::Write;

use bytes::{Bytes, BytesMut};
use flate2::{write::ZlibEncoder, Compression};
use serde::Serialize;
use tokio::sync::oneshot;

/// Serializes `payload` as `{"<kind>":<payload>}`, with no trailing
/// delimiter. Used both by [`Stream::write_record`] and by the event
/// loop to build the envelope bytes it stores as one ring-buffer
/// record, ahead of eventually draining that record into the stream.
pub fn envelope<T: Serialize>(kind: &str, payload: &T) -> Result<Vec<u8>, Error> {
    let mut line = Vec::with_capacity(64);
    line.extend_from_slice(b"{\"");
    line.extend_from_slice(kind.as_bytes());
    line.extend_from_slice(b"\":");
    serde_json::to_writer(&mut line, payload)?;
    line.push(b'}');
    Ok(line)
}

/// Errors produced by [`Stream`] operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The record could not be serialized to JSON.
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The compressor failed to accept or flush data.
    #[error("compressor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write was attempted after [`Stream::close`].
    #[error("stream is closed")]
    Closed,
}

/// A pending read request from the transport task: "give me up to
/// `len` bytes, or tell me there's nothing more coming."
#[derive(Debug)]
pub struct ChunkRequest {
    /// Maximum number of bytes the caller is prepared to receive.
    pub len: usize,
    reply: oneshot::Sender<ChunkReply>,
}

impl ChunkRequest {
    /// Builds a request for up to `len` bytes, replying on `reply`.
    #[must_use]
    pub fn new(len: usize, reply: oneshot::Sender<ChunkReply>) -> Self {
        ChunkRequest { len, reply }
    }

    /// Replies to this request with a chunk of data.
    pub fn respond_data(self, data: Bytes) {
        let _ = self.reply.send(ChunkReply::Data(data));
    }

    /// Replies to this request indicating the stream has ended.
    pub fn respond_eof(self) {
        let _ = self.reply.send(ChunkReply::Eof);
    }
}

/// The reply to a [`ChunkRequest`].
#[derive(Debug)]
pub enum ChunkReply {
    /// A chunk of compressed bytes.
    Data(Bytes),
    /// No more data will ever be produced for this request cycle.
    Eof,
}

/// The compressing NDJSON stream owned by the event loop.
///
/// Single-writer, single-reader by construction: the event loop both
/// feeds records in and services [`ChunkRequest`]s out. There is no
/// internal locking.
pub struct Stream {
    encoder: Option<ZlibEncoder<Vec<u8>>>,
    pending: BytesMut,
    flushed: u64,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    /// Creates a fresh, open stream.
    #[must_use]
    pub fn new() -> Self {
        Stream {
            encoder: Some(ZlibEncoder::new(Vec::new(), Compression::default())),
            pending: BytesMut::new(),
            flushed: 0,
        }
    }

    /// Reinstalls a fresh compressor and clears all counters, for
    /// reuse across request cycles.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Serializes `payload` as `{"<kind>":<payload>}`, appends a
    /// newline delimiter, and feeds the compressor.
    pub fn write_record<T: Serialize>(&mut self, kind: &str, payload: &T) -> Result<(), Error> {
        let mut line = envelope(kind, payload)?;
        line.push(b'\n');
        self.write_raw(&line)
    }

    /// Feeds already-framed bytes directly to the compressor. Used for
    /// the metadata record, which is built once per request rather
    /// than per event.
    pub fn write_raw(&mut self, framed: &[u8]) -> Result<(), Error> {
        let encoder = self.encoder.as_mut().ok_or(Error::Closed)?;
        encoder.write_all(framed)?;
        self.drain_encoder();
        Ok(())
    }

    /// Forces the compressor to emit any buffered data.
    pub fn flush(&mut self) -> Result<(), Error> {
        let encoder = self.encoder.as_mut().ok_or(Error::Closed)?;
        encoder.flush()?;
        self.drain_encoder();
        Ok(())
    }

    /// Closes the compressor, emitting its trailer, after which no
    /// further writes are accepted. Idempotent.
    pub fn close(&mut self) -> Result<(), Error> {
        if let Some(encoder) = self.encoder.take() {
            let buf = encoder.finish()?;
            self.pending.extend_from_slice(&buf);
        }
        Ok(())
    }

    /// Whether [`Stream::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.encoder.is_none()
    }

    /// Whether there is compressed data waiting to be read.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Compressed bytes produced but not yet handed to a reader. Added
    /// to [`Stream::flushed`], this is the request-size gating total.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Cumulative compressed bytes handed to a reader so far this
    /// request cycle. Drives request-size gating.
    #[must_use]
    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    /// Services a pending chunk request: replies with up to `req.len`
    /// bytes if any are pending, or EOF if the stream is closed and
    /// drained. Returns the request back, unconsumed, if neither
    /// condition holds yet -- the caller should hold onto it until the
    /// next call to this method after more data arrives.
    pub fn service(&mut self, req: ChunkRequest) -> Option<ChunkRequest> {
        if !self.pending.is_empty() {
            let n = req.len.min(self.pending.len());
            let chunk = self.pending.split_to(n).freeze();
            self.flushed += chunk.len() as u64;
            req.respond_data(chunk);
            return None;
        }
        if self.is_closed() {
            req.respond_eof();
            return None;
        }
        Some(req)
    }

    /// Moves whatever the compressor has produced so far out of its
    /// internal buffer and into `pending`, leaving the buffer empty so
    /// the next call only copies newly produced bytes rather than
    /// re-copying everything emitted so far this request.
    fn drain_encoder(&mut self) {
        if let Some(encoder) = self.encoder.as_mut() {
            let buf = encoder.get_mut();
            if !buf.is_empty() {
                self.pending.extend_from_slice(buf);
                buf.clear();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use flate2::read::ZlibDecoder;
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Tx {
        name: &'static str,
    }

    fn decompress_all(mut stream: Stream) -> Vec<u8> {
        stream.close().unwrap();
        let mut out = Vec::new();
        loop {
            let (tx, rx) = oneshot::channel();
            let req = ChunkRequest { len: 4096, reply: tx };
            if stream.service(req).is_some() {
                panic!("closed stream should never hold a request pending");
            }
            match futures_test_block_on(rx) {
                ChunkReply::Data(data) => out.extend_from_slice(&data),
                ChunkReply::Eof => break,
            }
        }
        out
    }

    fn futures_test_block_on(rx: oneshot::Receiver<ChunkReply>) -> ChunkReply {
        // The sender replies synchronously inside `service`, so the
        // oneshot is always ready by the time we get here.
        rx.try_recv().expect("reply must already be available")
    }

    #[test]
    fn round_trips_through_zlib() {
        let mut stream = Stream::new();
        stream.write_record("transaction", &Tx { name: "GET /" }).unwrap();
        stream.flush().unwrap();

        let compressed = decompress_all(stream);
        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut plain = String::new();
        decoder.read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "{\"transaction\":{\"name\":\"GET /\"}}\n");
    }

    #[test]
    fn flushed_counts_bytes_actually_read() {
        let mut stream = Stream::new();
        stream.write_record("transaction", &Tx { name: "GET /" }).unwrap();
        stream.flush().unwrap();
        assert_eq!(stream.flushed(), 0);

        let (tx, rx) = oneshot::channel();
        let req = ChunkRequest { len: 1, reply: tx };
        assert!(stream.service(req).is_none());
        let reply = futures_test_block_on(rx);
        assert!(matches!(reply, ChunkReply::Data(ref d) if d.len() == 1));
        assert_eq!(stream.flushed(), 1);
    }

    #[test]
    fn request_held_pending_until_data_or_close() {
        let mut stream = Stream::new();
        let (tx, _rx) = oneshot::channel();
        let req = ChunkRequest { len: 16, reply: tx };
        let held = stream.service(req);
        assert!(held.is_some(), "request should be held when nothing is pending yet");
    }

    #[test]
    fn reset_clears_counters() {
        let mut stream = Stream::new();
        stream.write_record("transaction", &Tx { name: "GET /" }).unwrap();
        stream.flush().unwrap();
        stream.reset();
        assert_eq!(stream.flushed(), 0);
        assert!(!stream.has_pending());
        assert!(!stream.is_closed());
    }
}

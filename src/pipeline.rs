//! Streaming pipeline (C4): reads a client body in fixed-size chunks,
//! updates a running SHA-256 inline (the "tee" pattern — one read per byte,
//! no second pass), and re-emits the same chunks downstream to the object
//! store. Memory use is bounded by the scratch buffer size regardless of
//! the object's total length.

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Default chunk size for the tee buffer. Small enough to keep peak memory
/// flat, large enough to avoid excessive syscall/poll overhead.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Wraps an inbound byte stream, hashing each chunk as it passes through.
/// The hasher's final state is only available after the stream is fully
/// drained — callers read `finalize_hash()` after forwarding every chunk.
pub struct HashingTee<S> {
    inner: S,
    hasher: Sha256,
    bytes_seen: u64,
}

impl<S> HashingTee<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_seen: 0,
        }
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Consume the tee and return the hex-encoded digest. Only meaningful
    /// once the wrapped stream has been fully polled to completion.
    pub fn finalize_hash(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<S> Stream for HashingTee<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.hasher.update(&chunk);
                self.bytes_seen += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Re-chunk an arbitrary byte stream into fixed-size `BytesMut` pieces, so
/// a chatty upstream (many tiny frames) doesn't translate into many tiny
/// store-side writes.
pub fn rechunk(
    stream: BoxStream<'static, std::io::Result<Bytes>>,
    chunk_size: usize,
) -> BoxStream<'static, std::io::Result<Bytes>> {
    let state = (stream, BytesMut::with_capacity(chunk_size));
    Box::pin(futures::stream::unfold(state, move |(mut stream, mut buf)| async move {
        loop {
            if buf.len() >= chunk_size {
                let out = buf.split_to(chunk_size).freeze();
                return Some((Ok(out), (stream, buf)));
            }
            match stream.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(e), (stream, buf))),
                None => {
                    if buf.is_empty() {
                        return None;
                    }
                    let out = std::mem::take(&mut buf).freeze();
                    return Some((Ok(out), (stream, buf)));
                }
            }
        }
    }))
}

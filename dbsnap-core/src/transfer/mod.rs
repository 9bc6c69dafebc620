//! Byte-stream plumbing between extractors, transforms and storage.

pub mod compression;
pub mod hash_stream;
pub mod progress;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

pub use compression::{compress, snapshot_reader, Compression};
pub use hash_stream::{DigestHandle, HashingStream};

/// An owned stream of byte chunks; errors end the stream.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Adapts the receiving half of a bounded channel into a [`ByteStream`].
///
/// The producer only gets to run ahead of the consumer by the channel capacity.
pub fn receiver_stream(rx: mpsc::Receiver<std::io::Result<Bytes>>) -> ByteStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// A single-chunk stream, for small payloads such as diff results.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    stream::once(async move { Ok(data) }).boxed()
}

/// Drains a stream into memory. Only for small artifacts and tests.
pub async fn collect_bytes(mut stream: ByteStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

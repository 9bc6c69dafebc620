//! Pass-through stream that computes a content digest as bytes flow by.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Shared slot the final digest is published into.
///
/// Stays empty until the wrapped stream has been fully drained.
#[derive(Debug, Clone, Default)]
pub struct DigestHandle {
    digest: Arc<Mutex<Option<String>>>,
}

impl DigestHandle {
    /// Hex-encoded MD5 of every byte forwarded, once the stream has ended.
    pub fn digest(&self) -> Option<String> {
        self.digest.lock().ok().and_then(|d| d.clone())
    }

    fn publish(&self, value: String) {
        if let Ok(mut slot) = self.digest.lock() {
            *slot = Some(value);
        }
    }
}

/// Stream wrapper that feeds every chunk into an MD5 context and forwards it unchanged
pub struct HashingStream<S> {
    inner: S,
    context: Option<md5::Context>,
    handle: DigestHandle,
}

impl<S> HashingStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S) -> (Self, DigestHandle) {
        let handle = DigestHandle::default();
        let stream = Self {
            inner,
            context: Some(md5::Context::new()),
            handle: handle.clone(),
        };
        (stream, handle)
    }
}

impl<S> Stream for HashingStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Some(ctx) = self.context.as_mut() {
                    ctx.consume(&bytes);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                // A failed stream never gets a digest.
                self.context = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(ctx) = self.context.take() {
                    self.handle.publish(format!("{:x}", ctx.finalize()));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    #[tokio::test]
    async fn test_digest_matches_whole_payload() {
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let (mut hashing, handle) = HashingStream::new(stream::iter(chunks));

        let mut forwarded = Vec::new();
        while let Some(chunk) = hashing.next().await {
            assert!(handle.digest().is_none());
            forwarded.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(forwarded, b"hello world");
        assert_eq!(
            handle.digest().as_deref(),
            Some(format!("{:x}", md5::compute(b"hello world")).as_str())
        );
    }

    #[tokio::test]
    async fn test_error_leaves_digest_unset() {
        let chunks = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("source died")),
        ];
        let (hashing, handle) = HashingStream::new(stream::iter(chunks));
        let results: Vec<_> = hashing.collect().await;

        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
        assert!(handle.digest().is_none());
    }
}

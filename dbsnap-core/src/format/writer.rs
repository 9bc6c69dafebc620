//! Producer side of a record stream.

use super::Record;
use crate::transfer::{receiver_stream, ByteStream};
use crate::utils::errors::{Result, SnapError};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Chunks buffered between an extractor and its consumer.
pub const CHANNEL_CAPACITY: usize = 64;

/// Writes serialized records into a bounded channel read as a [`ByteStream`].
///
/// Sends wait while the channel is full, so a slow consumer throttles the
/// extractor. A dropped consumer turns the next emit into
/// [`SnapError::Cancelled`].
#[derive(Debug, Clone)]
pub struct RecordSink {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl RecordSink {
    pub fn channel() -> (Self, ByteStream) {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, ByteStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, receiver_stream(rx))
    }

    pub async fn emit(&self, record: &Record) -> Result<()> {
        let line = record.to_line()?;
        self.tx.send(Ok(line)).await.map_err(|_| SnapError::Cancelled)
    }

    /// Blocking variant for producers running on the blocking pool.
    pub fn blocking_emit(&self, record: &Record) -> Result<()> {
        let line = record.to_line()?;
        self.tx.blocking_send(Ok(line)).map_err(|_| SnapError::Cancelled)
    }

    /// Terminates the stream with an error so the consumer cannot mistake a
    /// truncated snapshot for a complete one.
    pub async fn fail(&self, err: SnapError) {
        let _ = self.tx.send(Err(err.into_io())).await;
    }

    pub fn blocking_fail(&self, err: SnapError) {
        let _ = self.tx.blocking_send(Err(err.into_io()));
    }
}

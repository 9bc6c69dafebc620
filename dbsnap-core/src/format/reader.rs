//! Consumer side of a record stream.

use super::Record;
use crate::transfer::{snapshot_reader, ByteStream};
use crate::utils::errors::{Result, SnapError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Boxed reader returned by [`open_records`].
pub type BoxedRecordReader = RecordReader<Box<dyn AsyncBufRead + Send + Unpin>>;

/// Reads [`Record`]s line by line from any buffered reader.
///
/// Blank lines are ignored. Lines that are not valid records are skipped,
/// logged and counted in [`RecordReader::skipped_lines`]; I/O errors are
/// returned.
pub struct RecordReader<R> {
    inner: R,
    buf: Vec<u8>,
    line_no: u64,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
            line_no: 0,
            skipped: 0,
        }
    }

    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            self.buf.clear();
            let read = self
                .inner
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(SnapError::from_io)?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = trim_line(&self.buf);
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Record>(line) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(line = self.line_no, error = %e, "Skipping malformed snapshot line");
                }
            }
        }
    }

    /// Malformed lines skipped so far.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

/// Opens a downloaded snapshot (compressed or not) as a record reader.
pub async fn open_records(stream: ByteStream) -> Result<BoxedRecordReader> {
    Ok(RecordReader::new(snapshot_reader(stream).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::bytes_stream;

    #[tokio::test]
    async fn test_skips_malformed_and_blank_lines() {
        let input = concat!(
            "{\"type\":\"structure_start\",\"name\":\"t\"}\n",
            "\n",
            "{not json}\n",
            "{\"type\":\"mystery\"}\r\n",
            "{\"type\":\"row\",\"table\":\"t\",\"data\":{\"id\":1}}\r\n",
            "{\"type\":\"structure_end\",\"name\":\"t\"}",
        );
        let mut reader = open_records(bytes_stream(input)).await.unwrap();

        let mut records = Vec::new();
        while let Some(record) = reader.next_record().await.unwrap() {
            records.push(record);
        }

        assert_eq!(records.len(), 3);
        assert_eq!(records[1].structure_name(), Some("t"));
        assert_eq!(reader.skipped_lines(), 2);
    }

    #[tokio::test]
    async fn test_reads_structure_name_rows() {
        let input = concat!(
            "{\"type\":\"row\",\"structureName\":\"products\",\"data\":{\"id\":1,\"price\":500}}\n",
            "{\"type\":\"row\",\"structureName\":\"products\",\"data\":{\"id\":2,\"price\":700}}\n",
        );
        let mut reader = open_records(bytes_stream(input)).await.unwrap();

        let mut names = Vec::new();
        while let Some(record) = reader.next_record().await.unwrap() {
            names.push(record.structure_name().map(str::to_string));
        }

        assert_eq!(names, vec![Some("products".to_string()), Some("products".to_string())]);
        assert_eq!(reader.skipped_lines(), 0);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut reader = open_records(bytes_stream("")).await.unwrap();
        assert!(reader.next_record().await.unwrap().is_none());
        assert_eq!(reader.skipped_lines(), 0);
    }
}

//! Streaming compression for snapshot artifacts.
//!
//! Encoders sit between the extractor and the hash stage so the stored
//! checksum covers the compressed bytes. Readers sniff the codec from the
//! leading magic bytes, so consumers do not need to know how an artifact
//! was written.

use super::ByteStream;
use crate::utils::errors::{Result, SnapError};
use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression applied to a snapshot before it is hashed and uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    /// Suffix appended to the `.jsonl` object key.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }

    /// Identifies the codec from the first bytes of an artifact.
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if head.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

impl FromStr for Compression {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "false" => Ok(Compression::None),
            "gzip" | "gz" | "true" => Ok(Compression::Gzip),
            "zstd" | "zst" => Ok(Compression::Zstd),
            other => Err(SnapError::Storage(format!("Unknown compression codec: {other}"))),
        }
    }
}

/// Re-streams `stream` through the selected encoder.
pub fn compress(stream: ByteStream, codec: Compression) -> ByteStream {
    match codec {
        Compression::None => stream,
        Compression::Gzip => {
            let encoder = GzipEncoder::new(StreamReader::new(stream));
            ReaderStream::new(encoder).boxed()
        }
        Compression::Zstd => {
            let encoder =
                ZstdEncoder::with_quality(StreamReader::new(stream), async_compression::Level::Default);
            ReaderStream::new(encoder).boxed()
        }
    }
}

/// Opens a downloaded artifact as a buffered, decompressed reader.
pub async fn snapshot_reader(stream: ByteStream) -> Result<Box<dyn AsyncBufRead + Send + Unpin>> {
    let mut reader = StreamReader::new(stream);
    let codec = Compression::sniff(reader.fill_buf().await.map_err(SnapError::from_io)?);

    let decoded: Box<dyn AsyncBufRead + Send + Unpin> = match codec {
        Compression::Gzip => {
            let mut decoder = GzipDecoder::new(reader);
            decoder.multiple_members(true);
            Box::new(BufReader::new(decoder))
        }
        Compression::Zstd => Box::new(BufReader::new(ZstdDecoder::new(reader))),
        Compression::None => Box::new(reader),
    };
    Ok(decoded)
}

//! Error types for snapshot extraction, diff and restore.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapError {
    /// The source database could not be reached or refused the credentials.
    #[error("Source connection error: {0}")]
    SourceConnection(String),

    /// A read failed after the source connection was established.
    #[error("Source read error: {0}")]
    Source(String),

    /// The requested artifact does not exist in storage.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// A write into a restore target failed.
    #[error("Destination error: {0}")]
    Destination(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// A job payload that cannot be processed as given.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The consumer of a record stream went away before extraction finished.
    #[error("Stream consumer closed")]
    Cancelled,
}

impl SnapError {
    /// Converts into an `io::Error` so the failure can travel down a byte stream.
    ///
    /// The error rides along as the payload and [`SnapError::from_io`] gets it
    /// back. `NotFound` also keeps its io kind.
    pub fn into_io(self) -> std::io::Error {
        match self {
            SnapError::Io(e) => e,
            not_found @ SnapError::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, not_found),
            other => std::io::Error::other(other),
        }
    }

    /// Inverse of [`SnapError::into_io`]. Plain io errors become `Io`.
    pub fn from_io(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<SnapError>()) {
            return SnapError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<SnapError>()) {
            Some(Ok(carried)) => *carried,
            Some(Err(inner)) => SnapError::Io(std::io::Error::new(kind, inner)),
            None => SnapError::Io(kind.into()),
        }
    }

    /// Unwraps an error that came back out of a byte stream.
    pub fn recovered(self) -> Self {
        match self {
            SnapError::Io(e) => SnapError::from_io(e),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_survives_io_round_trip() {
        let io = SnapError::Source("relation \"users\" does not exist".into()).into_io();
        assert_eq!(io.kind(), std::io::ErrorKind::Other);
        assert!(matches!(SnapError::from_io(io), SnapError::Source(msg) if msg.contains("users")));

        let io = SnapError::NotFound("snapshots/p/x.jsonl".into()).into_io();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
        assert!(matches!(SnapError::Io(io).recovered(), SnapError::NotFound(_)));
    }

    #[test]
    fn test_plain_io_errors_stay_io() {
        let err = SnapError::from_io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(err, SnapError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe));
        assert!(matches!(SnapError::Cancelled.recovered(), SnapError::Cancelled));
    }
}

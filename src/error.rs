use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Every failure the pipeline can report.
///
/// Only `Config` is fatal; everything else is recovered per request.
#[derive(Error, Debug)]
pub enum Error {
    /// Key absent in the store or document absent in the index
    #[error("not found: {0}")]
    NotFound(String),

    /// Backing store unreachable or the operation failed
    #[error("store error: {0}")]
    Store(String),

    /// Search service unreachable or an upsert was rejected
    #[error("index error: {0}")]
    Index(String),

    /// A query reached the search service and failed there
    #[error("query error: {0}")]
    Query(String),

    /// A query was rejected before it was sent
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// Stored bytes are not a valid record
    #[error("decode error: {0}")]
    Decode(String),

    /// Malformed input to a write
    #[error("validation error: {0}")]
    Validation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The external media converter failed
    #[error("process error: {0}")]
    Process(String),
}

impl Error {
    /// Stable name of the error kind, used in structured responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::Store(_) => "StoreError",
            Error::Index(_) => "IndexError",
            Error::Query(_) | Error::MalformedQuery(_) => "QueryError",
            Error::Decode(_) => "DecodeError",
            Error::Validation(_) => "ValidationError",
            Error::Config(_) => "ConfigError",
            Error::Timeout { .. } => "Timeout",
            Error::Process(_) => "ProcessError",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bounds `fut` by `after`. The future is dropped (and so cancelled) on expiry.
pub async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout { op, after }),
    }
}

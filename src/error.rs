// Error taxonomy for the extraction engine.
//
// Transport failures are retryable and, once retries are exhausted, count as
// a non-success signal for the guess that triggered them. Only session-level
// problems (unparseable ciphertext, an oracle that never answers a full
// sweep) surface to the caller as errors; everything else is reported via
// completeness flags on the result.
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("oracle unavailable: a full charset sweep produced no signals")]
    OracleUnavailable,
}

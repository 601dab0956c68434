//! Error taxonomy for the driver.
//!
//! Every variant here corresponds to one row of the error taxonomy: most are
//! recovered at the component boundary and reported through the parameter
//! bus's message sink rather than aborting a run.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DriverError>;

/// All the ways a component in this driver can fail.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transient REST timeout, transient recv error, or a JSON line that
    /// failed the framing validation rule. Recovered by retry or skip.
    #[error("transient error: {0}")]
    Transient(String),

    /// A header line parsed as JSON but didn't contain a field the decoder
    /// required, or a field had the wrong type/range.
    #[error("bad frame header: {0}")]
    BadHeader(String),

    /// An enum index from the parameter bus was outside its valid range.
    #[error("bad enum value for {field}: {value}")]
    BadEnum {
        /// Name of the enum field that failed validation.
        field: &'static str,
        /// The out-of-range value that was supplied.
        value: i64,
    },

    /// A destination string didn't match one of `file:`, `http://`, `tcp://`.
    #[error("invalid destination path: {0}")]
    InvalidPath(String),

    /// The accumulator's shape didn't match an incoming frame's shape.
    #[error("accumulator shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Previously established shape.
        expected: (usize, usize),
        /// Shape of the frame that triggered the mismatch.
        got: (usize, usize),
    },

    /// The connection closed or errored before a frame's payload was fully
    /// received. The current frame is dropped; the reader continues.
    #[error("short payload: needed {needed} bytes, got {got}")]
    ShortPayload {
        /// Bytes the payload was supposed to contain.
        needed: usize,
        /// Bytes actually available before the connection gave out.
        got: usize,
    },

    /// The TCP peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A hostname failed to resolve, or a port was outside `1..=65535`.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// `start_acquisition` failed; any partially started workers have
    /// already been torn down by the time this is returned.
    #[error("start failed: {0}")]
    StartFailed(String),

    /// `stop_acquisition` failed to bring the run to a clean halt.
    #[error("stop failed: {0}")]
    StopFailed(String),

    /// Construction-time failure to create a channel mutex. The only
    /// variant that is not locally recoverable.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Transient(format!("io error: {e}"))
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        DriverError::Transient(format!("http error: {e}"))
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::BadHeader(format!("json error: {e}"))
    }
}

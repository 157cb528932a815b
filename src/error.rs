//! Error taxonomy for Spectre
//!
//! Every error in the core engine is one of the six kinds the spec assigns
//! distinct propagation rules to: `Transient` (retry), `Corruption`
//! (quarantine), `Invariant` (log & drop), `Backpressure` (fail fast to
//! caller), `Cancelled` (propagate), `Fatal` (surface to orchestrator).

use thiserror::Error;

/// Result type alias for Spectre operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Spectre
#[derive(Error, Debug)]
pub enum Error {
    /// Network/timeout/connection-reset talking to the graph, or a
    /// momentarily locked segment file. Safe to retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// A decoded record failed a structural check: truncated frame, bad
    /// UTF-8, unknown discriminant, or CRC/magic mismatch on a sealed
    /// segment. The offending segment is quarantined; scanning continues.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// EOF landed exactly at a frame boundary that was opened but never
    /// completed. Distinct from `CorruptRecord` because it is expected for
    /// the currently-open segment after a crash and is resolved by
    /// truncation, not quarantine.
    #[error("truncated tail: {0}")]
    TruncatedTail(String),

    /// An event or request violates a structural invariant: identity fields
    /// missing, timestamp outside any conceivable bucket, bad time range.
    /// Logged and dropped (event) or returned as a terminal RPC error
    /// (request).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The listener's bounded buffer is full; the caller must back off.
    #[error("backpressure: buffer exceeds capacity ({0} events)")]
    Backpressure(usize),

    /// The operation observed its cancellation token and stopped at the
    /// next atomic boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// Cannot open the data directory, cannot bind the gRPC socket, or any
    /// other condition the orchestrator should treat as a reason to exit
    /// non-zero.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Storage-layer errors that don't fit a more specific variant above
    /// (path manipulation, manifest sidecar issues).
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors outside the hand-rolled event
    /// codec (manifest JSON, cursor bytes, config).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Query-time errors surfaced by the timeline planner that are not
    /// invariant violations (e.g. a malformed cursor from a client).
    #[error("query error: {0}")]
    Query(String),

    /// IO errors bubbled up from `std::fs`/`std::io`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors C4's retry ladder should back off and re-attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True for errors that should cause the orchestrator to exit non-zero.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(e: tonic::Status) -> Self {
        Error::Query(e.to_string())
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match e {
            Error::Invariant(msg) => tonic::Status::invalid_argument(msg),
            Error::Fatal(msg) => tonic::Status::internal(msg),
            Error::Cancelled => tonic::Status::cancelled("client disconnected"),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(!Error::CorruptRecord("bad crc".into()).is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Fatal("cannot bind socket".into()).is_fatal());
        assert!(!Error::Backpressure(10).is_fatal());
    }
}

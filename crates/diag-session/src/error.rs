//! Session layer errors
//!
//! Nothing here is fatal to the process: every failure is scoped to
//! the session or to a single request and reported to the caller.

use doip_codec::{CodecError, NegativeResponseCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport-level connect failure; retrying `connect()` is valid
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The DoIP routing activation handshake did not complete
    #[error("Routing activation failed: {0}")]
    ActivationFailed(String),

    /// Command issued while the session cannot accept it
    #[error("Not connected")]
    NotConnected,

    /// Re-entrant connect while a session is already up or connecting
    #[error("Already connected")]
    AlreadyConnected,

    /// Frame-level decode failure; the offending frame is dropped
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No response arrived within the request deadline
    #[error("Request timed out")]
    RequestTimeout,

    /// ECU-reported failure, surfaced verbatim
    #[error("Negative response {nrc} for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    /// In-flight request invalidated by disconnect or explicit cancel
    #[error("Request cancelled")]
    Cancelled,

    /// The transport failed mid-session; the session is now disconnected
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A request for the same service id is still awaiting its response
    #[error("Request for service 0x{0:02X} already in flight")]
    RequestInFlight(u8),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// A response arrived but did not match the step's expectation
    #[error("Unexpected response: expected {expected}, received {received}")]
    UnexpectedResponse { expected: String, received: String },

    #[error("Sequence step {step} ({name}) failed: {source}")]
    Sequence {
        step: usize,
        name: String,
        #[source]
        source: Box<SessionError>,
    },

    #[error("Flash error: {0}")]
    Flash(String),
}

impl SessionError {
    pub(crate) fn sequence_step(step: usize, name: &str, source: SessionError) -> Self {
        Self::Sequence {
            step,
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}

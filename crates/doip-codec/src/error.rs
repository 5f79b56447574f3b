//! Codec layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported DoIP protocol version 0x{0:02X}")]
    UnsupportedVersion(u8),
}

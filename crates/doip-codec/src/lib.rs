//! doip-codec - DoIP frame and UDS service primitive codec
//!
//! Pure byte-level encoding/decoding for Diagnostics over IP (ISO 13400)
//! frames and the UDS (ISO 14229) request/response primitives carried
//! inside them. No I/O and no hidden state: every function transforms
//! in-memory buffers and is safe to call from multiple threads.

mod error;
mod frame;
pub mod uds;

pub use error::CodecError;
pub use frame::{
    decode_frame, payload_type, ActivationResult, DoipFrame, FrameDecoder, DOIP_HEADER_LEN,
    MAX_DIAG_PAYLOAD, PROTOCOL_VERSION_2012, PROTOCOL_VERSION_2019,
};
pub use uds::{parse_hex_request, NegativeResponseCode, UdsReply};

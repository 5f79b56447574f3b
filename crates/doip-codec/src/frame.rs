//! DoIP frame encoding and decoding (ISO 13400-2)
//!
//! A DoIP frame is an 8-byte header (protocol version, inverse version,
//! payload type, payload length) followed by the payload. Diagnostic
//! message payloads carry the tester and ECU logical addresses in front
//! of the UDS bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

/// DoIP header size: version + inverse + payload type (u16) + length (u32)
pub const DOIP_HEADER_LEN: usize = 8;

/// ISO 13400-2:2012 protocol version byte
pub const PROTOCOL_VERSION_2012: u8 = 0x02;

/// ISO 13400-2:2019 protocol version byte
pub const PROTOCOL_VERSION_2019: u8 = 0x03;

/// Largest UDS payload accepted inside a diagnostic message
pub const MAX_DIAG_PAYLOAD: usize = 4095;

/// Largest payload length field accepted before the frame is rejected
const MAX_FRAME_PAYLOAD: usize = MAX_DIAG_PAYLOAD + 4;

/// DoIP payload type identifiers
pub mod payload_type {
    pub const GENERIC_NACK: u16 = 0x0000;
    pub const ROUTING_ACTIVATION_REQUEST: u16 = 0x0005;
    pub const ROUTING_ACTIVATION_RESPONSE: u16 = 0x0006;
    pub const ALIVE_CHECK_REQUEST: u16 = 0x0007;
    pub const ALIVE_CHECK_RESPONSE: u16 = 0x0008;
    pub const DIAGNOSTIC_MESSAGE: u16 = 0x8001;
    pub const DIAGNOSTIC_ACK: u16 = 0x8002;
    pub const DIAGNOSTIC_NACK: u16 = 0x8003;
}

/// Routing activation response codes (ISO 13400-2 table 49)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationResult {
    /// 0x10 - routing successfully activated
    Success,
    /// 0x11 - activated, confirmation required
    ConfirmationRequired,
    /// Any other code - activation denied
    Denied(u8),
}

impl From<u8> for ActivationResult {
    fn from(code: u8) -> Self {
        match code {
            0x10 => Self::Success,
            0x11 => Self::ConfirmationRequired,
            other => Self::Denied(other),
        }
    }
}

/// A decoded DoIP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoipFrame {
    RoutingActivationRequest {
        source_address: u16,
        activation_code: u8,
    },
    RoutingActivationResponse {
        tester_address: u16,
        entity_address: u16,
        result: ActivationResult,
    },
    AliveCheckRequest,
    AliveCheckResponse {
        source_address: u16,
    },
    /// Diagnostic message carrying a UDS payload
    Diagnostic {
        source_address: u16,
        target_address: u16,
        payload: Vec<u8>,
    },
    DiagnosticAck {
        source_address: u16,
        target_address: u16,
        ack_code: u8,
    },
    DiagnosticNack {
        source_address: u16,
        target_address: u16,
        nack_code: u8,
    },
    GenericNack {
        nack_code: u8,
    },
    /// Payload type without a dedicated decoder; kept for raw sends
    Other {
        payload_type: u16,
        payload: Vec<u8>,
    },
}

fn is_supported_version(version: u8) -> bool {
    version == PROTOCOL_VERSION_2012 || version == PROTOCOL_VERSION_2019
}

impl DoipFrame {
    /// Routing activation request with the four ISO-reserved zero bytes
    pub fn routing_activation(source_address: u16, activation_code: u8) -> Self {
        Self::RoutingActivationRequest {
            source_address,
            activation_code,
        }
    }

    pub fn diagnostic(source_address: u16, target_address: u16, payload: Vec<u8>) -> Self {
        Self::Diagnostic {
            source_address,
            target_address,
            payload,
        }
    }

    pub fn alive_check_response(source_address: u16) -> Self {
        Self::AliveCheckResponse { source_address }
    }

    pub fn payload_type(&self) -> u16 {
        match self {
            Self::RoutingActivationRequest { .. } => payload_type::ROUTING_ACTIVATION_REQUEST,
            Self::RoutingActivationResponse { .. } => payload_type::ROUTING_ACTIVATION_RESPONSE,
            Self::AliveCheckRequest => payload_type::ALIVE_CHECK_REQUEST,
            Self::AliveCheckResponse { .. } => payload_type::ALIVE_CHECK_RESPONSE,
            Self::Diagnostic { .. } => payload_type::DIAGNOSTIC_MESSAGE,
            Self::DiagnosticAck { .. } => payload_type::DIAGNOSTIC_ACK,
            Self::DiagnosticNack { .. } => payload_type::DIAGNOSTIC_NACK,
            Self::GenericNack { .. } => payload_type::GENERIC_NACK,
            Self::Other { payload_type, .. } => *payload_type,
        }
    }

    fn payload_bytes(&self) -> Vec<u8> {
        match self {
            Self::RoutingActivationRequest {
                source_address,
                activation_code,
            } => {
                let mut p = Vec::with_capacity(7);
                p.extend_from_slice(&source_address.to_be_bytes());
                p.push(*activation_code);
                p.extend_from_slice(&[0x00; 4]);
                p
            }
            Self::RoutingActivationResponse {
                tester_address,
                entity_address,
                result,
            } => {
                let code = match result {
                    ActivationResult::Success => 0x10,
                    ActivationResult::ConfirmationRequired => 0x11,
                    ActivationResult::Denied(c) => *c,
                };
                let mut p = Vec::with_capacity(9);
                p.extend_from_slice(&tester_address.to_be_bytes());
                p.extend_from_slice(&entity_address.to_be_bytes());
                p.push(code);
                p.extend_from_slice(&[0x00; 4]);
                p
            }
            Self::AliveCheckRequest => Vec::new(),
            Self::AliveCheckResponse { source_address } => source_address.to_be_bytes().to_vec(),
            Self::Diagnostic {
                source_address,
                target_address,
                payload,
            } => {
                let mut p = Vec::with_capacity(4 + payload.len());
                p.extend_from_slice(&source_address.to_be_bytes());
                p.extend_from_slice(&target_address.to_be_bytes());
                p.extend_from_slice(payload);
                p
            }
            Self::DiagnosticAck {
                source_address,
                target_address,
                ack_code,
            } => {
                let mut p = Vec::with_capacity(5);
                p.extend_from_slice(&source_address.to_be_bytes());
                p.extend_from_slice(&target_address.to_be_bytes());
                p.push(*ack_code);
                p
            }
            Self::DiagnosticNack {
                source_address,
                target_address,
                nack_code,
            } => {
                let mut p = Vec::with_capacity(5);
                p.extend_from_slice(&source_address.to_be_bytes());
                p.extend_from_slice(&target_address.to_be_bytes());
                p.push(*nack_code);
                p
            }
            Self::GenericNack { nack_code } => vec![*nack_code],
            Self::Other { payload, .. } => payload.clone(),
        }
    }

    /// Encode this frame with the given protocol version byte.
    ///
    /// The inverse version is derived as the one's complement.
    pub fn encode(&self, version: u8) -> Result<Vec<u8>, CodecError> {
        if !is_supported_version(version) {
            return Err(CodecError::UnsupportedVersion(version));
        }
        if let Self::Diagnostic { payload, .. } = self {
            if payload.len() > MAX_DIAG_PAYLOAD {
                return Err(CodecError::MalformedFrame(format!(
                    "diagnostic payload of {} bytes exceeds maximum {}",
                    payload.len(),
                    MAX_DIAG_PAYLOAD
                )));
            }
        }

        let payload = self.payload_bytes();
        let mut buf = BytesMut::with_capacity(DOIP_HEADER_LEN + payload.len());
        buf.put_u8(version);
        buf.put_u8(!version);
        buf.put_u16(self.payload_type());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }
}

/// Decode one frame from the front of `buf`, consuming its bytes.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete
/// frame. On `UnsupportedVersion` or a version/inverse mismatch the
/// remaining buffer is discarded: the length field of a foreign frame
/// cannot be trusted, so there is no safe resynchronization point.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<DoipFrame>, CodecError> {
    if buf.len() < DOIP_HEADER_LEN {
        return Ok(None);
    }

    let version = buf[0];
    let inverse = buf[1];
    if !is_supported_version(version) {
        buf.clear();
        return Err(CodecError::UnsupportedVersion(version));
    }
    if inverse != !version {
        buf.clear();
        return Err(CodecError::MalformedFrame(format!(
            "inverse version 0x{inverse:02X} does not complement version 0x{version:02X}"
        )));
    }

    let ptype = u16::from_be_bytes([buf[2], buf[3]]);
    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if length > MAX_FRAME_PAYLOAD {
        buf.clear();
        return Err(CodecError::MalformedFrame(format!(
            "payload length {length} exceeds maximum {MAX_FRAME_PAYLOAD}"
        )));
    }
    if buf.len() < DOIP_HEADER_LEN + length {
        return Ok(None);
    }

    buf.advance(DOIP_HEADER_LEN);
    let payload = buf.split_to(length);
    parse_payload(ptype, &payload).map(Some)
}

fn parse_payload(ptype: u16, p: &[u8]) -> Result<DoipFrame, CodecError> {
    let short = |what: &str| {
        CodecError::MalformedFrame(format!("{what} payload truncated ({} bytes)", p.len()))
    };

    let frame = match ptype {
        payload_type::DIAGNOSTIC_MESSAGE => {
            if p.len() < 4 {
                return Err(short("diagnostic message"));
            }
            DoipFrame::Diagnostic {
                source_address: u16::from_be_bytes([p[0], p[1]]),
                target_address: u16::from_be_bytes([p[2], p[3]]),
                payload: p[4..].to_vec(),
            }
        }
        payload_type::DIAGNOSTIC_ACK => {
            if p.len() < 5 {
                return Err(short("diagnostic ack"));
            }
            DoipFrame::DiagnosticAck {
                source_address: u16::from_be_bytes([p[0], p[1]]),
                target_address: u16::from_be_bytes([p[2], p[3]]),
                ack_code: p[4],
            }
        }
        payload_type::DIAGNOSTIC_NACK => {
            if p.len() < 5 {
                return Err(short("diagnostic nack"));
            }
            DoipFrame::DiagnosticNack {
                source_address: u16::from_be_bytes([p[0], p[1]]),
                target_address: u16::from_be_bytes([p[2], p[3]]),
                nack_code: p[4],
            }
        }
        payload_type::ROUTING_ACTIVATION_REQUEST => {
            if p.len() < 3 {
                return Err(short("routing activation request"));
            }
            DoipFrame::RoutingActivationRequest {
                source_address: u16::from_be_bytes([p[0], p[1]]),
                activation_code: p[2],
            }
        }
        payload_type::ROUTING_ACTIVATION_RESPONSE => {
            if p.len() < 5 {
                return Err(short("routing activation response"));
            }
            DoipFrame::RoutingActivationResponse {
                tester_address: u16::from_be_bytes([p[0], p[1]]),
                entity_address: u16::from_be_bytes([p[2], p[3]]),
                result: ActivationResult::from(p[4]),
            }
        }
        payload_type::ALIVE_CHECK_REQUEST => DoipFrame::AliveCheckRequest,
        payload_type::ALIVE_CHECK_RESPONSE => {
            if p.len() < 2 {
                return Err(short("alive check response"));
            }
            DoipFrame::AliveCheckResponse {
                source_address: u16::from_be_bytes([p[0], p[1]]),
            }
        }
        payload_type::GENERIC_NACK => {
            if p.is_empty() {
                return Err(short("generic nack"));
            }
            DoipFrame::GenericNack { nack_code: p[0] }
        }
        other => DoipFrame::Other {
            payload_type: other,
            payload: p.to_vec(),
        },
    };
    Ok(frame)
}

/// Incremental frame decoder over a growable byte buffer.
///
/// The transport read path appends raw TCP bytes with [`FrameDecoder::extend`]
/// and drains complete frames with [`FrameDecoder::next_frame`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<DoipFrame>, CodecError> {
        decode_frame(&mut self.buf)
    }

    /// Bytes buffered but not yet consumed as a frame
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn roundtrip(frame: DoipFrame) -> DoipFrame {
        let bytes = frame.encode(PROTOCOL_VERSION_2012).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        decode_frame(&mut buf).unwrap().unwrap()
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(17)]
    #[case(256)]
    #[case(MAX_DIAG_PAYLOAD)]
    fn diagnostic_roundtrip(#[case] len: usize) {
        let frame = DoipFrame::diagnostic(0x0E80, 0x0001, vec![0xA5; len]);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn routing_activation_roundtrip() {
        let frame = DoipFrame::routing_activation(0x0E80, 0x00);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn activation_response_codes() {
        for (code, expected) in [
            (0x10, ActivationResult::Success),
            (0x11, ActivationResult::ConfirmationRequired),
            (0x06, ActivationResult::Denied(0x06)),
        ] {
            let frame = DoipFrame::RoutingActivationResponse {
                tester_address: 0x0E80,
                entity_address: 0x0E00,
                result: ActivationResult::from(code),
            };
            assert_eq!(roundtrip(frame), DoipFrame::RoutingActivationResponse {
                tester_address: 0x0E80,
                entity_address: 0x0E00,
                result: expected,
            });
        }
    }

    #[test]
    fn oversize_diagnostic_rejected_at_encode() {
        let frame = DoipFrame::diagnostic(0x0E80, 0x0001, vec![0; MAX_DIAG_PAYLOAD + 1]);
        assert!(matches!(
            frame.encode(PROTOCOL_VERSION_2012),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn both_protocol_versions_accepted() {
        let frame = DoipFrame::diagnostic(0x0E80, 0x0001, vec![0x10, 0x01]);
        for version in [PROTOCOL_VERSION_2012, PROTOCOL_VERSION_2019] {
            let bytes = frame.encode(version).unwrap();
            let mut buf = BytesMut::from(&bytes[..]);
            assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), frame);
        }
    }

    #[test]
    fn unknown_version_rejected() {
        let frame = DoipFrame::diagnostic(0x0E80, 0x0001, vec![0x3E, 0x00]);
        assert_eq!(
            frame.encode(0x01),
            Err(CodecError::UnsupportedVersion(0x01))
        );

        let mut bytes = frame.encode(PROTOCOL_VERSION_2012).unwrap();
        bytes[0] = 0x04;
        bytes[1] = !0x04;
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            decode_frame(&mut buf),
            Err(CodecError::UnsupportedVersion(0x04))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn inverse_version_mismatch_is_malformed() {
        let frame = DoipFrame::diagnostic(0x0E80, 0x0001, vec![0x3E, 0x00]);
        let mut bytes = frame.encode(PROTOCOL_VERSION_2012).unwrap();
        bytes[1] = 0x00;
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn length_field_must_match_payload_structure() {
        // Diagnostic message too short to carry the two logical addresses
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION_2012);
        buf.put_u8(!PROTOCOL_VERSION_2012);
        buf.put_u16(payload_type::DIAGNOSTIC_MESSAGE);
        buf.put_u32(2);
        buf.put_slice(&[0x0E, 0x80]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn incomplete_frames_wait_for_more_bytes() {
        let frame = DoipFrame::diagnostic(0x0E80, 0x0001, vec![0x22, 0xF1, 0x90]);
        let bytes = frame.encode(PROTOCOL_VERSION_2012).unwrap();

        // Feed byte-by-byte to exercise every split point.
        let mut decoder = FrameDecoder::new();
        for (i, byte) in bytes.iter().enumerate() {
            decoder.extend(std::slice::from_ref(byte));
            let got = decoder.next_frame().unwrap();
            if i + 1 < bytes.len() {
                assert_eq!(got, None);
            } else {
                assert_eq!(got, Some(frame.clone()));
            }
        }
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let a = DoipFrame::diagnostic(0x0E80, 0x0001, vec![0x10, 0x01]);
        let b = DoipFrame::AliveCheckRequest;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&a.encode(PROTOCOL_VERSION_2012).unwrap());
        decoder.extend(&b.encode(PROTOCOL_VERSION_2012).unwrap());

        assert_eq!(decoder.next_frame().unwrap(), Some(a));
        assert_eq!(decoder.next_frame().unwrap(), Some(b));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.pending_len(), 0);
    }
}

//! UDS (ISO 14229) service primitives
//!
//! Classification of raw UDS payloads into positive/negative replies,
//! the negative response code table, and helpers for the hex command
//! text accepted by the tester surface.

use crate::error::CodecError;

/// Offset added to a request SID to form its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Service id of a negative response frame (`7F <sid> <nrc>`)
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Sub-function bit requesting suppression of the positive response
pub const SUPPRESS_POS_RSP_BIT: u8 = 0x80;

/// Standard UDS service id constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
}

/// Services whose second byte is a sub-function that can carry the
/// suppress-positive-response bit.
const SUB_FUNCTION_SERVICES: &[u8] = &[
    service_id::DIAGNOSTIC_SESSION_CONTROL,
    service_id::ECU_RESET,
    service_id::SECURITY_ACCESS,
    service_id::COMMUNICATION_CONTROL,
    service_id::ROUTINE_CONTROL,
    service_id::TESTER_PRESENT,
    service_id::CONTROL_DTC_SETTING,
];

/// Whether the request asks the ECU to suppress its positive response,
/// meaning no UDS reply should be awaited.
pub fn suppresses_response(request: &[u8]) -> bool {
    match (request.first(), request.get(1)) {
        (Some(sid), Some(sub)) => {
            SUB_FUNCTION_SERVICES.contains(sid) && sub & SUPPRESS_POS_RSP_BIT != 0
        }
        _ => false,
    }
}

/// Whether `reply` answers a request with service id `sid`
pub fn answers(sid: u8, reply: &[u8]) -> bool {
    match reply.first() {
        Some(&first) if first == sid.wrapping_add(POSITIVE_RESPONSE_OFFSET) => true,
        Some(&NEGATIVE_RESPONSE_SID) => reply.get(1) == Some(&sid),
        _ => false,
    }
}

/// A classified UDS reply payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsReply {
    Positive { sid: u8, data: Vec<u8> },
    Negative { sid: u8, nrc: NegativeResponseCode },
}

impl UdsReply {
    /// Classify a raw UDS payload received from the ECU.
    pub fn classify(payload: &[u8]) -> Result<Self, CodecError> {
        match payload {
            [] => Err(CodecError::MalformedFrame("empty UDS payload".into())),
            [NEGATIVE_RESPONSE_SID, rest @ ..] => {
                if rest.len() < 2 {
                    return Err(CodecError::MalformedFrame(
                        "negative response shorter than 3 bytes".into(),
                    ));
                }
                Ok(Self::Negative {
                    sid: rest[0],
                    nrc: NegativeResponseCode::from(rest[1]),
                })
            }
            [first, rest @ ..] => Ok(Self::Positive {
                sid: first.wrapping_sub(POSITIVE_RESPONSE_OFFSET),
                data: rest.to_vec(),
            }),
        }
    }

    pub fn is_response_pending(&self) -> bool {
        matches!(
            self,
            Self::Negative {
                nrc: NegativeResponseCode::ResponsePending,
                ..
            }
        )
    }
}

/// UDS negative response codes relevant to session, security access and
/// software download handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    Unknown(u8),
}

impl NegativeResponseCode {
    pub fn code(self) -> u8 {
        use NegativeResponseCode::*;
        match self {
            GeneralReject => 0x10,
            ServiceNotSupported => 0x11,
            SubFunctionNotSupported => 0x12,
            IncorrectMessageLengthOrFormat => 0x13,
            BusyRepeatRequest => 0x21,
            ConditionsNotCorrect => 0x22,
            RequestSequenceError => 0x24,
            RequestOutOfRange => 0x31,
            SecurityAccessDenied => 0x33,
            InvalidKey => 0x35,
            ExceededNumberOfAttempts => 0x36,
            RequiredTimeDelayNotExpired => 0x37,
            UploadDownloadNotAccepted => 0x70,
            GeneralProgrammingFailure => 0x72,
            WrongBlockSequenceCounter => 0x73,
            ResponsePending => 0x78,
            SubFunctionNotSupportedInActiveSession => 0x7E,
            ServiceNotSupportedInActiveSession => 0x7F,
            Unknown(v) => v,
        }
    }

    fn name(self) -> &'static str {
        use NegativeResponseCode::*;
        match self {
            GeneralReject => "GeneralReject",
            ServiceNotSupported => "ServiceNotSupported",
            SubFunctionNotSupported => "SubFunctionNotSupported",
            IncorrectMessageLengthOrFormat => "IncorrectMessageLengthOrFormat",
            BusyRepeatRequest => "BusyRepeatRequest",
            ConditionsNotCorrect => "ConditionsNotCorrect",
            RequestSequenceError => "RequestSequenceError",
            RequestOutOfRange => "RequestOutOfRange",
            SecurityAccessDenied => "SecurityAccessDenied",
            InvalidKey => "InvalidKey",
            ExceededNumberOfAttempts => "ExceededNumberOfAttempts",
            RequiredTimeDelayNotExpired => "RequiredTimeDelayNotExpired",
            UploadDownloadNotAccepted => "UploadDownloadNotAccepted",
            GeneralProgrammingFailure => "GeneralProgrammingFailure",
            WrongBlockSequenceCounter => "WrongBlockSequenceCounter",
            ResponsePending => "ResponsePending",
            SubFunctionNotSupportedInActiveSession => "SubFunctionNotSupportedInActiveSession",
            ServiceNotSupportedInActiveSession => "ServiceNotSupportedInActiveSession",
            Unknown(_) => "Unknown",
        }
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        use NegativeResponseCode::*;
        match value {
            0x10 => GeneralReject,
            0x11 => ServiceNotSupported,
            0x12 => SubFunctionNotSupported,
            0x13 => IncorrectMessageLengthOrFormat,
            0x21 => BusyRepeatRequest,
            0x22 => ConditionsNotCorrect,
            0x24 => RequestSequenceError,
            0x31 => RequestOutOfRange,
            0x33 => SecurityAccessDenied,
            0x35 => InvalidKey,
            0x36 => ExceededNumberOfAttempts,
            0x37 => RequiredTimeDelayNotExpired,
            0x70 => UploadDownloadNotAccepted,
            0x72 => GeneralProgrammingFailure,
            0x73 => WrongBlockSequenceCounter,
            0x78 => ResponsePending,
            0x7E => SubFunctionNotSupportedInActiveSession,
            0x7F => ServiceNotSupportedInActiveSession,
            other => Unknown(other),
        }
    }
}

impl std::fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Parse the hex command text the tester surface accepts ("10 01",
/// "1001", "0x10 0x01") into raw UDS bytes.
pub fn parse_hex_request(text: &str) -> Result<Vec<u8>, CodecError> {
    let cleaned: String = text
        .split_whitespace()
        .map(|tok| tok.trim_start_matches("0x"))
        .collect();

    if cleaned.is_empty() {
        return Err(CodecError::MalformedFrame("empty command text".into()));
    }
    if cleaned.len() % 2 != 0 {
        return Err(CodecError::MalformedFrame(format!(
            "odd number of hex digits in command text '{text}'"
        )));
    }
    hex::decode(&cleaned)
        .map_err(|e| CodecError::MalformedFrame(format!("invalid hex in command text: {e}")))
}

//! Connection parameters and JSON configuration import
//!
//! The external configuration document uses hex-string fields
//! (`"0x0E80"` style) under `ethernet`, `doip` and `parameter`
//! sections. Everything is validated before a `connect()` is accepted;
//! the parameters are immutable once a connection attempt starts.

use std::path::Path;
use std::time::Duration;

use doip_codec::{PROTOCOL_VERSION_2012, PROTOCOL_VERSION_2019};
use serde::Deserialize;

use crate::error::SessionError;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_ACTIVATION_TIMEOUT_MS: u64 = 2000;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TESTER_PRESENT_INTERVAL_MS: u64 = 2000;

/// Validated parameters for one connection attempt
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    pub remote_ip: String,
    pub remote_port: u16,
    pub vendor: String,
    /// DoIP protocol version byte (0x02 or 0x03)
    pub protocol_version: u8,
    /// Tester logical address
    pub tester_addr: u16,
    /// ECU logical address
    pub ecu_addr: u16,
    /// Gateway (SGA) logical address
    pub sga_addr: u16,
    pub activation_code: u8,
    pub tester_present: bool,
    pub tester_present_interval: Duration,
    pub connect_timeout: Duration,
    pub activation_timeout: Duration,
    pub response_timeout: Duration,
}

impl ConnectionParameters {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SessionError::InvalidParameters(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, SessionError> {
        let doc: ConfigDocument = serde_json::from_str(contents)
            .map_err(|e| SessionError::InvalidParameters(format!("config parse error: {e}")))?;
        let params = Self::try_from(doc)?;
        params.validate()?;
        Ok(params)
    }

    /// Reject invalid combinations before any connection attempt.
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |msg: String| Err(SessionError::InvalidParameters(msg));

        if self.remote_ip.trim().is_empty() {
            return invalid("remote_ip must not be empty".into());
        }
        if self.remote_port == 0 {
            return invalid("remote_port must be non-zero".into());
        }
        if self.tester_addr == 0 || self.ecu_addr == 0 || self.sga_addr == 0 {
            return invalid("tester, ECU and SGA logical addresses must be non-zero".into());
        }
        if self.protocol_version != PROTOCOL_VERSION_2012
            && self.protocol_version != PROTOCOL_VERSION_2019
        {
            return invalid(format!(
                "unsupported DoIP version 0x{:02X}",
                self.protocol_version
            ));
        }
        if self.tester_present && self.tester_present_interval.is_zero() {
            return invalid("tester-present interval must be non-zero when enabled".into());
        }
        Ok(())
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }
}

// External JSON document shape

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    ethernet: EthernetSection,
    doip: DoipSection,
    #[serde(default)]
    parameter: ParameterSection,
}

#[derive(Debug, Deserialize)]
struct EthernetSection {
    remote_ip: String,
    remote_port: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    vendor: String,
}

#[derive(Debug, Deserialize)]
struct DoipSection {
    version: String,
    tester_addr: String,
    ecu_addr: String,
    sga_addr: String,
    activation_code: String,
}

#[derive(Debug, Default, Deserialize)]
struct ParameterSection {
    #[serde(default)]
    tester_present: bool,
    #[serde(default)]
    tester_present_interval: Option<String>,
}

impl TryFrom<ConfigDocument> for ConnectionParameters {
    type Error = SessionError;

    fn try_from(doc: ConfigDocument) -> Result<Self, SessionError> {
        // Only the tester-as-client role is supported; the original
        // server role never applied to a diagnostic tester.
        if let Some(role) = &doc.ethernet.role {
            if role != "client" {
                return Err(SessionError::InvalidParameters(format!(
                    "unsupported role '{role}', only 'client' is implemented"
                )));
            }
        }

        let remote_port: u16 = doc.ethernet.remote_port.trim().parse().map_err(|_| {
            SessionError::InvalidParameters(format!(
                "remote_port '{}' is not a valid port number",
                doc.ethernet.remote_port
            ))
        })?;

        let tester_present_interval = match &doc.parameter.tester_present_interval {
            Some(text) => parse_duration(text).ok_or_else(|| {
                SessionError::InvalidParameters(format!(
                    "tester_present_interval '{text}' is not a valid duration"
                ))
            })?,
            None => Duration::from_millis(DEFAULT_TESTER_PRESENT_INTERVAL_MS),
        };

        Ok(Self {
            remote_ip: doc.ethernet.remote_ip,
            remote_port,
            vendor: doc.ethernet.vendor,
            protocol_version: parse_hex_field::<u8>("doip.version", &doc.doip.version)?,
            tester_addr: parse_hex_field::<u16>("doip.tester_addr", &doc.doip.tester_addr)?,
            ecu_addr: parse_hex_field::<u16>("doip.ecu_addr", &doc.doip.ecu_addr)?,
            sga_addr: parse_hex_field::<u16>("doip.sga_addr", &doc.doip.sga_addr)?,
            activation_code: parse_hex_field::<u8>(
                "doip.activation_code",
                &doc.doip.activation_code,
            )?,
            tester_present: doc.parameter.tester_present,
            tester_present_interval,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            activation_timeout: Duration::from_millis(DEFAULT_ACTIVATION_TIMEOUT_MS),
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
        })
    }
}

/// Parse a `"0x0E80"` style hex field into an integer type.
fn parse_hex_field<T: HexField>(field: &str, value: &str) -> Result<T, SessionError> {
    let digits = value.trim().trim_start_matches("0x");
    T::from_hex(digits).ok_or_else(|| {
        SessionError::InvalidParameters(format!("{field} '{value}' is not a valid hex value"))
    })
}

trait HexField: Sized {
    fn from_hex(digits: &str) -> Option<Self>;
}

impl HexField for u8 {
    fn from_hex(digits: &str) -> Option<Self> {
        u8::from_str_radix(digits, 16).ok()
    }
}

impl HexField for u16 {
    fn from_hex(digits: &str) -> Option<Self> {
        u16::from_str_radix(digits, 16).ok()
    }
}

/// Parse a duration string: `"100ms"`, `"2s"`, `"5m"`, `"1h"`. A bare
/// number is taken as milliseconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    let unit = &text[digits.len()..];
    let value: u64 = digits.parse().ok()?;

    let millis = match unit {
        "" | "ms" => value,
        "s" => value.checked_mul(1000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        _ => return None,
    };
    Some(Duration::from_millis(millis))
}

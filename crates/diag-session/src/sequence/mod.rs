//! Diagnostic sequence scripts
//!
//! A script is imported from a JSON document with a `parameter`
//! section, a `sequence` step list and an optional `fail_handler` step
//! list that runs best-effort after a failed step. Step actions are
//! compiled once at load time so execution never re-parses text.

pub mod executor;

use std::time::Duration;

use doip_codec::uds;
use serde::Deserialize;
use serde_json::Value;

use crate::config::parse_duration;
use crate::error::SessionError;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters shared by the whole script
#[derive(Debug, Clone, Default)]
pub struct ScriptParameters {
    pub vin: Option<String>,
    pub algorithm: Option<String>,
    keys: [Option<Vec<u8>>; 4],
    pub tester_present: bool,
}

impl ScriptParameters {
    /// Key material for a security access level, if the script carries it.
    pub fn key_for(&self, level: u8) -> Option<&[u8]> {
        self.keys
            .get(level.checked_sub(1)? as usize)?
            .as_deref()
    }
}

/// What a response must look like for a step to pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Any positive response
    Any,
    /// Response starts with these bytes
    Prefix(Vec<u8>),
    /// Response equals these bytes exactly
    Exact(Vec<u8>),
}

impl Expect {
    pub fn matches(&self, response: &[u8]) -> bool {
        match self {
            Self::Any => response.first() != Some(&uds::NEGATIVE_RESPONSE_SID),
            Self::Prefix(prefix) => response.starts_with(prefix),
            Self::Exact(bytes) => response == bytes,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Any => "any positive response".to_string(),
            Self::Prefix(prefix) => format!("prefix {}", hex::encode(prefix)),
            Self::Exact(bytes) => hex::encode(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Connect,
    Disconnect,
    /// Diagnostic requests paired positionally with expectations
    SendDiag {
        requests: Vec<Vec<u8>>,
        expects: Vec<Expect>,
    },
    SecurityAccess {
        level: u8,
    },
    Wait {
        duration: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub name: String,
    pub timeout: Duration,
    pub kind: StepKind,
    /// A failing step is logged but does not abort the run
    pub continue_on_fail: bool,
}

#[derive(Debug, Clone)]
pub struct SequenceScript {
    pub parameters: ScriptParameters,
    pub steps: Vec<SequenceStep>,
    pub fail_handler: Vec<SequenceStep>,
}

// Raw JSON document shape

#[derive(Debug, Deserialize)]
struct SequenceFile {
    #[serde(default)]
    parameter: RawParameters,
    sequence: Vec<RawStep>,
    #[serde(default)]
    fail_handler: Vec<RawStep>,
}

#[derive(Debug, Default, Deserialize)]
struct RawParameters {
    #[serde(default)]
    vin: Option<String>,
    #[serde(default)]
    algorithm: Option<String>,
    #[serde(default)]
    key_lv1: Option<String>,
    #[serde(default)]
    key_lv2: Option<String>,
    #[serde(default)]
    key_lv3: Option<String>,
    #[serde(default)]
    key_lv4: Option<String>,
    #[serde(default)]
    tester_present: bool,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    action: Value,
    #[serde(default)]
    expect: Value,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    fail: Option<String>,
}

impl SequenceScript {
    pub fn from_json_str(contents: &str) -> Result<Self, SessionError> {
        let file: SequenceFile = serde_json::from_str(contents)
            .map_err(|e| SessionError::InvalidParameters(format!("sequence parse error: {e}")))?;

        let parameters = compile_parameters(file.parameter)?;
        let steps = compile_steps(&file.sequence)?;
        let fail_handler = compile_steps(&file.fail_handler)?;
        if steps.is_empty() {
            return Err(SessionError::InvalidParameters(
                "sequence has no steps".into(),
            ));
        }
        Ok(Self {
            parameters,
            steps,
            fail_handler,
        })
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, SessionError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SessionError::InvalidParameters(format!(
                "cannot read sequence {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&contents)
    }
}

fn compile_parameters(raw: RawParameters) -> Result<ScriptParameters, SessionError> {
    let mut keys: [Option<Vec<u8>>; 4] = Default::default();
    for (slot, text) in [&raw.key_lv1, &raw.key_lv2, &raw.key_lv3, &raw.key_lv4]
        .into_iter()
        .enumerate()
    {
        if let Some(text) = text {
            let bytes = uds::parse_hex_request(text).map_err(|e| {
                SessionError::InvalidParameters(format!("key_lv{}: {e}", slot + 1))
            })?;
            keys[slot] = Some(bytes);
        }
    }
    Ok(ScriptParameters {
        vin: raw.vin,
        algorithm: raw.algorithm,
        keys,
        tester_present: raw.tester_present,
    })
}

fn compile_steps(raw: &[RawStep]) -> Result<Vec<SequenceStep>, SessionError> {
    raw.iter().map(compile_step).collect()
}

fn compile_step(raw: &RawStep) -> Result<SequenceStep, SessionError> {
    let bad = |msg: String| SessionError::InvalidParameters(format!("step '{}': {msg}", raw.name));

    let kind = match &raw.action {
        Value::String(text) => match compile_action_text(text).map_err(&bad)? {
            Some(kind) => kind,
            None => {
                let request = uds::parse_hex_request(text).map_err(|e| bad(e.to_string()))?;
                StepKind::SendDiag {
                    requests: vec![request],
                    expects: compile_expects(&raw.expect, 1)?,
                }
            }
        },
        Value::Array(items) => {
            let requests: Vec<Vec<u8>> = items
                .iter()
                .map(|item| match item {
                    Value::String(text) => {
                        uds::parse_hex_request(text).map_err(|e| bad(e.to_string()))
                    }
                    other => Err(bad(format!("non-string request {other}"))),
                })
                .collect::<Result<_, _>>()?;
            if requests.is_empty() {
                return Err(bad("empty request list".into()));
            }
            let expects = compile_expects(&raw.expect, requests.len())?;
            StepKind::SendDiag { requests, expects }
        }
        other => return Err(bad(format!("unsupported action {other}"))),
    };

    let timeout = match &raw.timeout {
        Some(text) => {
            parse_duration(text).ok_or_else(|| bad(format!("invalid timeout '{text}'")))?
        }
        None => DEFAULT_STEP_TIMEOUT,
    };

    Ok(SequenceStep {
        name: raw.name.clone(),
        timeout,
        kind,
        continue_on_fail: raw.fail.as_deref() == Some("continue"),
    })
}

/// Recognize the non-diagnostic action keywords. `Ok(None)` means the
/// text is a plain hex request.
fn compile_action_text(text: &str) -> Result<Option<StepKind>, String> {
    let trimmed = text.trim();
    match trimmed {
        "connect" => return Ok(Some(StepKind::Connect)),
        "disconnect" => return Ok(Some(StepKind::Disconnect)),
        _ => {}
    }
    if let Some(arg) = trimmed.strip_prefix("wait ") {
        let duration =
            parse_duration(arg).ok_or_else(|| format!("invalid wait duration '{arg}'"))?;
        return Ok(Some(StepKind::Wait { duration }));
    }
    if let Some(arg) = trimmed.strip_prefix("security_access ") {
        let level: u8 = arg
            .trim()
            .parse()
            .map_err(|_| format!("invalid security access level '{arg}'"))?;
        return Ok(Some(StepKind::SecurityAccess { level }));
    }
    Ok(None)
}

/// Compile the `expect` field: null or "*" is any positive response, a
/// trailing "*" makes a prefix match, anything else must match exactly.
fn compile_expects(value: &Value, count: usize) -> Result<Vec<Expect>, SessionError> {
    let compile_one = |text: &str| -> Result<Expect, SessionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Expect::Any);
        }
        let (body, prefix) = match trimmed.strip_suffix('*') {
            Some(body) => (body.trim(), true),
            None => (trimmed, false),
        };
        let bytes = uds::parse_hex_request(body).map_err(|e| {
            SessionError::InvalidParameters(format!("invalid expect '{text}': {e}"))
        })?;
        Ok(if prefix {
            Expect::Prefix(bytes)
        } else {
            Expect::Exact(bytes)
        })
    };

    let mut expects = match value {
        Value::Null => vec![],
        Value::String(text) => vec![compile_one(text)?],
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => Ok(Expect::Any),
                Value::String(text) => compile_one(text),
                other => Err(SessionError::InvalidParameters(format!(
                    "non-string expect {other}"
                ))),
            })
            .collect::<Result<_, _>>()?,
        other => {
            return Err(SessionError::InvalidParameters(format!(
                "unsupported expect {other}"
            )))
        }
    };
    expects.resize(count, Expect::Any);
    Ok(expects)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SCRIPT: &str = r#"{
        "parameter": {
            "vin": "YV1ZW25V0M1234567",
            "key_lv1": "11 22 33 44",
            "tester_present": true
        },
        "sequence": [
            { "name": "open", "action": "connect" },
            { "name": "default session", "action": "10 01", "expect": "50 01*", "timeout": "2s" },
            { "name": "unlock", "action": "security_access 1" },
            { "name": "read parts", "action": ["22 F1 90", "22 F1 20"], "expect": ["62 F1 90*", null] },
            { "name": "settle", "action": "wait 100ms" },
            { "name": "close", "action": "disconnect" }
        ],
        "fail_handler": [
            { "name": "cleanup", "action": "disconnect" }
        ]
    }"#;

    #[test]
    fn compiles_full_script() {
        let script = SequenceScript::from_json_str(SCRIPT).unwrap();
        assert_eq!(script.steps.len(), 6);
        assert_eq!(script.fail_handler.len(), 1);
        assert_eq!(script.parameters.vin.as_deref(), Some("YV1ZW25V0M1234567"));
        assert_eq!(
            script.parameters.key_for(1),
            Some(&[0x11, 0x22, 0x33, 0x44][..])
        );
        assert_eq!(script.parameters.key_for(2), None);

        assert_eq!(script.steps[0].kind, StepKind::Connect);
        assert_eq!(
            script.steps[1].kind,
            StepKind::SendDiag {
                requests: vec![vec![0x10, 0x01]],
                expects: vec![Expect::Prefix(vec![0x50, 0x01])],
            }
        );
        assert_eq!(script.steps[1].timeout, Duration::from_secs(2));
        assert_eq!(script.steps[2].kind, StepKind::SecurityAccess { level: 1 });
        assert_eq!(
            script.steps[3].kind,
            StepKind::SendDiag {
                requests: vec![vec![0x22, 0xF1, 0x90], vec![0x22, 0xF1, 0x20]],
                expects: vec![Expect::Prefix(vec![0x62, 0xF1, 0x90]), Expect::Any],
            }
        );
        assert_eq!(
            script.steps[4].kind,
            StepKind::Wait {
                duration: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn expect_matching() {
        assert!(Expect::Any.matches(&[0x50, 0x01]));
        assert!(!Expect::Any.matches(&[0x7F, 0x10, 0x22]));
        assert!(Expect::Prefix(vec![0x50]).matches(&[0x50, 0x01, 0x02]));
        assert!(Expect::Exact(vec![0x50, 0x01]).matches(&[0x50, 0x01]));
        assert!(!Expect::Exact(vec![0x50, 0x01]).matches(&[0x50, 0x01, 0x02]));
        // An explicit negative expectation can pass
        assert!(Expect::Prefix(vec![0x7F, 0x10]).matches(&[0x7F, 0x10, 0x11]));
    }

    #[test]
    fn rejects_empty_sequence() {
        let result = SequenceScript::from_json_str(r#"{ "sequence": [] }"#);
        assert!(matches!(
            result,
            Err(SessionError::InvalidParameters(_))
        ));
    }

    #[test]
    fn rejects_bad_action() {
        let json = r#"{ "sequence": [ { "name": "x", "action": 42 } ] }"#;
        assert!(SequenceScript::from_json_str(json).is_err());
    }
}

//! DoIP/UDS diagnostic session core
//!
//! Everything a diagnostic tester needs between a parsed frame and a
//! user command: connection lifecycle with routing activation,
//! request/response correlation, tester-present keep-alive, scripted
//! sequences and VBF software download. [`SessionCore`] is the façade;
//! the transport behind it is swappable for tests.

pub mod config;
pub mod correlator;
pub mod error;
pub mod flash;
pub mod keepalive;
pub mod sequence;
pub mod session;
pub mod transport;

pub use config::{parse_duration, ConnectionParameters};
pub use correlator::{Correlator, DiagnosticResponse};
pub use error::SessionError;
pub use flash::{FlashDriver, FlashFile, FlashSet, VbfFlashDriver, VbfHeader};
pub use sequence::{SequenceScript, SequenceStep, StepKind};
pub use session::{
    SecurityAccessState, SecurityPhase, SessionCore, SessionEvent, SessionState, StepOutcome,
};
pub use transport::{
    ChannelPair, FrameSink, FrameSource, MockBehaviour, MockTransport, TcpTransport, Transport,
};

//! Session state machine types and events

mod core;

pub use self::core::SessionCore;

/// Lifecycle state of a diagnostic session. Transitions are owned by
/// [`SessionCore`]; observers only ever see snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Security access handshake in progress
    Authenticating,
    /// Security access unlocked at some level
    Authenticated,
    Disconnecting,
}

impl SessionState {
    /// States in which diagnostic traffic may be sent
    pub fn is_online(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Progress of the security access handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPhase {
    #[default]
    Locked,
    SeedRequested,
    Unlocked,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityAccessState {
    pub phase: SecurityPhase,
    /// Access level of the last attempt
    pub level: u8,
    pub last_seed: Option<Vec<u8>>,
    /// Failed unlock attempts since connect
    pub attempts: u32,
}

/// Outcome of one sequence step, carried on [`SessionEvent::SequenceStep`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Started,
    Passed,
    Failed(String),
}

/// Events broadcast to session observers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    ConnectionLost { reason: String },
    SequenceStep {
        index: usize,
        name: String,
        outcome: StepOutcome,
    },
    FlashProgress {
        file: String,
        percent: u8,
    },
}

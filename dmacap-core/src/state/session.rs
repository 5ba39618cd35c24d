//! Session lifecycle state machine.
//!
//! Provides a `SessionPhase` enum that models the lifecycle of one
//! capture session, with validated transitions that return `Result`
//! instead of panicking.

use std::time::Instant;

use crate::error::CaptureError;

// ── FailureKind ──────────────────────────────────────────────────

/// Category of a fatal session error. Each maps to a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The connection was refused.
    Connection,
    /// The negotiated parameters could not be applied.
    Negotiation,
    /// The stream reported an error or disappeared.
    Transport,
    /// The stream never reached `Streaming` in time.
    StartupTimeout,
    /// The session was configured inconsistently.
    Setup,
}

impl FailureKind {
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Connection => 1,
            Self::Negotiation => 2,
            Self::Transport => 3,
            Self::StartupTimeout => 5,
            Self::Setup => 6,
        }
    }
}

/// A terminal error recorded in [`SessionPhase::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&CaptureError> for Failure {
    fn from(e: &CaptureError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ── SessionPhase ─────────────────────────────────────────────────

/// The current phase of a capture session.
///
/// ```text
///  Unconnected ──► Connecting ──► Negotiating ◄──► Streaming
///       │               │              │               │
///       └───────────────┴──────┬───────┴───────────────┘
///                              ▼
///                     Stopped  |  Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Nothing requested yet.
    #[default]
    Unconnected,

    /// Connection request in flight.
    Connecting,

    /// Connected; waiting for a format and for buffers.
    Negotiating,

    /// Buffers are flowing.
    Streaming {
        /// When the session (last) entered `Streaming`.
        since: Instant,
    },

    /// The run loop returned normally. Terminal.
    Stopped,

    /// A fatal error ended the session. Terminal.
    Failed(Failure),
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unconnected => write!(f, "Unconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Negotiating => write!(f, "Negotiating"),
            Self::Streaming { .. } => write!(f, "Streaming"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed(_) => write!(f, "Failed"),
        }
    }
}

impl SessionPhase {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    /// `Stopped` and `Failed` absorb every further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(f) => Some(f),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Unconnected`.
    pub fn begin_connect(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::Unconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(CaptureError::InvalidTransition(
                "cannot connect: not in Unconnected state",
            )),
        }
    }

    /// Transition to `Negotiating`.
    ///
    /// Valid from: `Connecting` (connection accepted) and `Streaming`
    /// (the server paused the stream to renegotiate).
    pub fn begin_negotiation(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::Connecting | Self::Streaming { .. } => {
                *self = Self::Negotiating;
                Ok(())
            }
            _ => Err(CaptureError::InvalidTransition(
                "cannot negotiate: not in Connecting or Streaming state",
            )),
        }
    }

    /// Transition to `Streaming`.
    ///
    /// Valid from: `Negotiating`.
    pub fn begin_streaming(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::Negotiating => {
                *self = Self::Streaming {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(CaptureError::InvalidTransition(
                "cannot stream: not in Negotiating state",
            )),
        }
    }

    /// Transition to `Stopped`.
    ///
    /// Valid from any non-terminal state.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        if self.is_terminal() {
            return Err(CaptureError::InvalidTransition(
                "cannot stop: session already ended",
            ));
        }
        *self = Self::Stopped;
        Ok(())
    }

    /// Transition to `Failed`.
    ///
    /// Valid from any non-terminal state.
    pub fn fail(&mut self, failure: Failure) -> Result<(), CaptureError> {
        if self.is_terminal() {
            return Err(CaptureError::InvalidTransition(
                "cannot fail: session already ended",
            ));
        }
        *self = Self::Failed(failure);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

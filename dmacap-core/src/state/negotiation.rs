//! Format negotiation state machine.

use crate::error::CaptureError;

/// Where the format/buffer handshake currently stands.
///
/// ```text
///  AwaitingFormat ──► FormatProposed ──► ParamsSubmitted ──► BuffersReady
///                        ▲      │               │                 │
///                        │      ▼               ▼                 │
///                        └── NegotiationFailed ◄┘                 │
///                        └────────────────────────────────────────┘
/// ```
///
/// `NegotiationFailed` is not terminal: the server may propose again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationPhase {
    #[default]
    AwaitingFormat,
    FormatProposed,
    ParamsSubmitted,
    BuffersReady,
    NegotiationFailed,
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AwaitingFormat => "AwaitingFormat",
            Self::FormatProposed => "FormatProposed",
            Self::ParamsSubmitted => "ParamsSubmitted",
            Self::BuffersReady => "BuffersReady",
            Self::NegotiationFailed => "NegotiationFailed",
        };
        f.write_str(name)
    }
}

impl NegotiationPhase {
    /// A format proposal arrived.
    ///
    /// Valid from every phase except `FormatProposed` itself, since a
    /// proposal is always resolved before the next event is handled.
    pub fn propose(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::FormatProposed => Err(CaptureError::InvalidTransition(
                "cannot propose: previous proposal unresolved",
            )),
            _ => {
                *self = Self::FormatProposed;
                Ok(())
            }
        }
    }

    /// Buffer parameters were accepted by the transport.
    ///
    /// Valid from: `FormatProposed`.
    pub fn submit(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::FormatProposed => {
                *self = Self::ParamsSubmitted;
                Ok(())
            }
            _ => Err(CaptureError::InvalidTransition(
                "cannot submit: no format proposed",
            )),
        }
    }

    /// The server allocated buffers and started delivering.
    ///
    /// Valid from: `ParamsSubmitted`.
    pub fn buffers_ready(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::ParamsSubmitted => {
                *self = Self::BuffersReady;
                Ok(())
            }
            _ => Err(CaptureError::InvalidTransition(
                "cannot mark buffers ready: parameters not submitted",
            )),
        }
    }

    /// The proposal was unusable, or the submission was rejected.
    ///
    /// Valid from: `FormatProposed`, `ParamsSubmitted`.
    pub fn fail(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::FormatProposed | Self::ParamsSubmitted => {
                *self = Self::NegotiationFailed;
                Ok(())
            }
            _ => Err(CaptureError::InvalidTransition(
                "cannot fail negotiation: nothing in flight",
            )),
        }
    }
}

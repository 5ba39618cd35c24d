//! Domain-specific error types for the capture session.
//!
//! Session-level failures are [`CaptureError`]. Per-frame failures are
//! [`FrameError`] and never leave the frame channel: they are logged and
//! the frame is dropped. Format proposals that cannot be understood are
//! [`NegotiationError`], and the POD codec reports [`PodError`].

use std::time::Duration;
use thiserror::Error;

use crate::frame::DataType;
use crate::memory::SyncPhase;
use crate::state::FailureKind;

/// The canonical session-level error type.
#[derive(Debug, Error)]
pub enum CaptureError {
    // ── Connection Errors ────────────────────────────────────────
    /// The transport refused the initial connection request.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server dropped the stream after it was connected.
    #[error("connection to the capture node was lost")]
    ConnectionLost,

    // ── Negotiation Errors ───────────────────────────────────────
    /// A format proposal could not be parsed.
    #[error("invalid format proposal: {0}")]
    Negotiation(#[from] NegotiationError),

    /// The transport rejected the buffer parameters we submitted.
    #[error("buffer parameters rejected: {0}")]
    ParamsRejected(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The stream reported an asynchronous error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The stream did not start within the configured startup window.
    #[error("stream not started after {0:?}")]
    StartupTimeout(Duration),

    // ── Setup Errors ─────────────────────────────────────────────
    /// A format catalog was built from inconsistent ranges or lists.
    #[error("invalid format catalog: {0}")]
    InvalidCatalog(&'static str),

    /// A state machine refused a transition.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// Encoding or decoding of a parameter POD failed.
    #[error("pod error: {0}")]
    Pod(#[from] PodError),

    /// The requested functionality is not compiled in or not available
    /// on this platform.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// An OS-level I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CaptureError {
    /// The failure category this error puts a session into.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Connection(_) | Self::Io(_) | Self::Unsupported(_) => FailureKind::Connection,
            Self::Negotiation(_) | Self::ParamsRejected(_) | Self::Pod(_) => {
                FailureKind::Negotiation
            }
            Self::Transport(_) | Self::ConnectionLost => FailureKind::Transport,
            Self::StartupTimeout(_) => FailureKind::StartupTimeout,
            Self::InvalidCatalog(_) | Self::InvalidTransition(_) | Self::Other(_) => {
                FailureKind::Setup
            }
        }
    }

    /// Process exit code for a session that ended with this error.
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}

impl From<String> for CaptureError {
    fn from(s: String) -> Self {
        CaptureError::Other(s)
    }
}

impl From<&str> for CaptureError {
    fn from(s: &str) -> Self {
        CaptureError::Other(s.to_string())
    }
}

// ── FrameError ───────────────────────────────────────────────────

/// Reasons a single frame was dropped.
///
/// None of these are fatal; the next frame starts from a clean slate.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The dequeued buffer carried no data planes.
    #[error("buffer has no data planes")]
    NoPlanes,

    /// The chunk reported a stride that cannot describe a frame.
    #[error("invalid chunk stride {0}")]
    InvalidStride(i32),

    /// The region to map does not fit in the address space.
    #[error("mapping length overflows ({stride} x {height} + {offset})")]
    LengthOverflow { stride: u32, height: u32, offset: u32 },

    /// The frame described by the chunk extends past the plane.
    #[error("frame needs {len} bytes but the plane holds {max_size}")]
    PlaneTooSmall { len: u32, max_size: u32 },

    /// The plane is backed by memory this consumer cannot map.
    #[error("unsupported backing type {0}")]
    UnsupportedDataType(DataType),

    /// A buffer was delivered before any format was negotiated.
    #[error("no format negotiated yet")]
    NotNegotiated,

    /// `mmap` of the backing file descriptor failed.
    #[error("mapping {len} bytes of fd {fd} failed: {source}")]
    Map {
        fd: i64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// A DMA-BUF synchronization directive failed.
    #[error("dma-buf sync {phase} failed on fd {fd}: {source}")]
    Sync {
        fd: i64,
        phase: SyncPhase,
        #[source]
        source: std::io::Error,
    },

    /// `munmap` failed.
    #[error("unmap failed: {0}")]
    Unmap(#[source] std::io::Error),

    /// The buffer could not be handed back to the server.
    #[error("release failed: {0}")]
    Release(String),

    /// Memory mapping is not available on this platform.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

// ── NegotiationError ─────────────────────────────────────────────

/// Why a format proposal was not accepted.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The POD is not a `Format` object.
    #[error("expected a Format object, got object type {object_type:#x} id {id}")]
    NotFormatObject { object_type: u32, id: u32 },

    /// The POD decoded to something other than an object.
    #[error("format parameter is not an object")]
    NotAnObject,

    /// The proposal is not raw video.
    #[error("not raw video (media type {media_type}, subtype {media_subtype})")]
    NotRawVideo { media_type: u32, media_subtype: u32 },

    /// A required property is absent.
    #[error("missing property: {0}")]
    MissingProperty(&'static str),

    /// A property holds a value of the wrong type.
    #[error("unexpected value for property {0}")]
    UnexpectedValue(&'static str),

    /// The pixel format id is not one this consumer can read.
    #[error("unknown video format id {0}")]
    UnknownFormat(u32),

    /// The proposed resolution has a zero dimension.
    #[error("zero-sized resolution {width}x{height}")]
    ZeroSize { width: u32, height: u32 },

    /// A tightly packed frame at the proposed size does not fit the
    /// buffer size field.
    #[error("resolution {width}x{height} is too large")]
    FrameTooLarge { width: u32, height: u32 },

    /// The payload is not a valid POD.
    #[error("malformed pod: {0}")]
    Pod(#[from] PodError),
}

// ── PodError ─────────────────────────────────────────────────────

/// Errors from the POD codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PodError {
    /// The input ended before a complete value was read.
    #[error("truncated pod: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// A structural rule of the encoding was violated.
    #[error("malformed pod: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CaptureError::ParamsRejected("busy".into());
        assert!(e.to_string().contains("busy"));

        let e = PodError::Truncated {
            needed: 16,
            available: 3,
        };
        assert!(e.to_string().contains("16"));
        assert!(e.to_string().contains('3'));
    }

    #[test]
    fn exit_codes_by_category() {
        assert_eq!(CaptureError::Connection("refused".into()).exit_code(), 1);
        assert_eq!(CaptureError::ParamsRejected("no".into()).exit_code(), 2);
        assert_eq!(CaptureError::Transport("boom".into()).exit_code(), 3);
        assert_eq!(CaptureError::ConnectionLost.exit_code(), 3);
        assert_eq!(
            CaptureError::StartupTimeout(Duration::from_secs(1)).exit_code(),
            5
        );
    }

    #[test]
    fn from_string() {
        let e: CaptureError = "something broke".into();
        assert!(matches!(e, CaptureError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: CaptureError = io_err.into();
        assert!(matches!(e, CaptureError::Io(_)));
    }
}

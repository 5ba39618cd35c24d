//! The seam between the capture core and the stream transport.
//!
//! A [`Transport`] owns the event loop and the remote stream. The core
//! hands it a [`StreamHandlers`] struct of closures when connecting; the
//! transport invokes them from its loop thread, passing a
//! [`StreamControl`] (to update parameters or stop the loop) and, for
//! frame notifications, a [`BufferQueue`].
//!
//! All callbacks run on one thread, one at a time.

use std::time::Duration;

use bitflags::bitflags;

use crate::error::{CaptureError, FrameError};
use crate::frame::FrameBuffer;

// ── StreamState ──────────────────────────────────────────────────

/// Stream state as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    /// The stream failed; the string is the server's explanation.
    Error(String),
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unconnected => write!(f, "unconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Paused => write!(f, "paused"),
            Self::Streaming => write!(f, "streaming"),
            Self::Error(msg) => write!(f, "error ({msg})"),
        }
    }
}

bitflags! {
    /// Capability flags attached to a connection request
    /// (`PW_STREAM_FLAG_*`). The server may honor them only in part.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StreamFlags: u32 {
        /// Link to the best matching node automatically.
        const AUTOCONNECT = 1 << 0;
        const INACTIVE = 1 << 1;
        /// Ask the transport to map buffer memory for us where it can.
        const MAP_BUFFERS = 1 << 2;
        const DRIVER = 1 << 3;
        const RT_PROCESS = 1 << 4;
        const NO_CONVERT = 1 << 5;
        const EXCLUSIVE = 1 << 6;
        const DONT_RECONNECT = 1 << 7;
        const ALLOC_BUFFERS = 1 << 8;
    }
}

impl Default for StreamFlags {
    fn default() -> Self {
        Self::AUTOCONNECT | Self::MAP_BUFFERS
    }
}

// ── ConnectRequest ───────────────────────────────────────────────

/// Everything the transport needs to open the capture stream.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Node to capture from. `None` lets the server pick.
    pub target: Option<u32>,
    pub flags: StreamFlags,
    /// Encoded `EnumFormat` PODs, in preference order.
    pub params: Vec<Vec<u8>>,
}

// ── Callback-side traits ─────────────────────────────────────────

/// Control over the stream, available inside callbacks.
pub trait StreamControl {
    /// Replace the stream's negotiated parameters (e.g. `Buffers`).
    fn update_params(&mut self, params: &[Vec<u8>]) -> Result<(), CaptureError>;

    /// Ask the run loop to return.
    fn stop(&mut self);
}

/// The stream's pool of filled buffers.
pub trait BufferQueue {
    /// Take the next filled buffer, if any.
    fn dequeue(&mut self) -> Option<FrameBuffer>;

    /// Hand a buffer back to the server.
    fn queue(&mut self, buffer: FrameBuffer) -> Result<(), FrameError>;
}

/// Fires once if the stream has not started after `timeout`.
pub struct StartupWatchdog {
    pub timeout: Duration,
    /// Returns `true` when the loop should stop.
    pub on_expired: Box<dyn FnMut() -> bool>,
}

/// The per-session event table.
pub struct StreamHandlers {
    /// `(old, new, control)`
    pub state_changed: Box<dyn FnMut(&StreamState, &StreamState, &mut dyn StreamControl)>,
    /// `(param_id, pod, control)`; the pod is `None` when a param is cleared.
    pub param_changed: Box<dyn FnMut(u32, Option<&[u8]>, &mut dyn StreamControl)>,
    /// A buffer is ready to be dequeued.
    pub process: Box<dyn FnMut(&mut dyn BufferQueue, &mut dyn StreamControl)>,
    pub watchdog: Option<StartupWatchdog>,
}

// ── Transport ────────────────────────────────────────────────────

/// A connection to the media server plus the loop that drives it.
pub trait Transport {
    /// Create the stream, register `handlers`, and request a connection.
    fn connect(
        &mut self,
        request: ConnectRequest,
        handlers: StreamHandlers,
    ) -> Result<(), CaptureError>;

    /// Block until the loop is told to stop. Returns the loop's exit code.
    fn run(&mut self) -> i32;

    /// Release the stream, then the loop. Idempotent.
    fn shutdown(&mut self);
}

//! # dmacap-core
//!
//! Zero-copy video capture from a PipeWire node.
//!
//! This crate contains:
//! - **POD codec**: `Value`, `Object`, `Choice` and the SPA binary layout
//! - **Format catalog**: the candidate formats offered to the server
//! - **Negotiation**: parsing the chosen format, sizing the buffer request
//! - **Frame channel**: dequeue, map, DMA-BUF sync, sink callback, release
//! - **Session**: lifecycle state machines and the `SessionController`
//! - **Transport**: the trait seam plus a PipeWire backend (`pipewire` feature)
//! - **Shutdown**: `SIGINT`/`SIGTERM` turned into a clean stop request
//! - **Error**: `CaptureError`, `FrameError`, `NegotiationError`, `PodError`

pub mod backend;
pub mod error;
pub mod format;
pub mod frame;
pub mod memory;
pub mod negotiate;
pub mod pod;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use backend::{PipeWireOptions, PipeWireTransport};
pub use error::{CaptureError, FrameError, NegotiationError, PodError};
pub use format::{FormatCatalog, Modifier, ValueRange, VideoFormat, VideoFormatDescriptor};
pub use frame::{
    BufferHandle, Chunk, DataPlane, DataType, FrameBuffer, FrameChannel, FrameOutcome, FrameSink,
    FrameStats, FrameView, MetaRecord,
};
pub use memory::{DmaBufMapper, MemoryMapper, SyncPhase};
pub use negotiate::{
    BufferAllocationRequest, BufferPolicy, DataTypes, NegotiatedFormat, ParamNegotiator,
    ParamOutcome,
};
pub use pod::{Fraction, Rectangle};
pub use session::{Session, SessionConfig, SessionController, SessionOutcome};
pub use state::{Failure, FailureKind, NegotiationPhase, SessionPhase};
pub use transport::{
    BufferQueue, ConnectRequest, StartupWatchdog, StreamControl, StreamFlags, StreamHandlers,
    StreamState, Transport,
};

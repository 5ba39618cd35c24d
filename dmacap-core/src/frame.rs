//! Per-frame delivery: dequeue, map, sync, hand to the sink, release.

use tracing::{debug, warn};

use crate::error::FrameError;
use crate::format::VideoFormat;
use crate::memory::{MemoryMapper, SyncPhase};
use crate::negotiate::NegotiatedFormat;
use crate::transport::BufferQueue;

// ── Buffer description ───────────────────────────────────────────

/// Backing memory of a data plane (`SPA_DATA_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Invalid,
    MemPtr,
    MemFd,
    DmaBuf,
    MemId,
    Other(u32),
}

impl DataType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::MemPtr,
            2 => Self::MemFd,
            3 => Self::DmaBuf,
            4 => Self::MemId,
            other => Self::Other(other),
        }
    }

    /// Whether the plane carries an fd we can `mmap`.
    pub fn is_mappable(self) -> bool {
        matches!(self, Self::MemFd | Self::DmaBuf)
    }

    /// Whether CPU access must be bracketed by sync directives.
    pub fn needs_sync(self) -> bool {
        self == Self::DmaBuf
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => f.write_str("Invalid"),
            Self::MemPtr => f.write_str("MemPtr"),
            Self::MemFd => f.write_str("MemFd"),
            Self::DmaBuf => f.write_str("DmaBuf"),
            Self::MemId => f.write_str("MemId"),
            Self::Other(raw) => write!(f, "Unknown({raw})"),
        }
    }
}

/// Valid region of a plane, as written by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPlane {
    pub data_type: DataType,
    pub fd: i64,
    pub map_offset: u32,
    pub max_size: u32,
    pub chunk: Chunk,
}

/// Ancillary metadata attached to a buffer. Not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaRecord {
    pub meta_type: u32,
    pub size: u32,
}

/// Identifies a buffer to the transport that lent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

/// A buffer borrowed from the server between dequeue and queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub handle: BufferHandle,
    pub planes: Vec<DataPlane>,
    pub metas: Vec<MetaRecord>,
}

// ── FrameView ────────────────────────────────────────────────────

/// One mapped frame, valid for the duration of a sink call.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    data: &'a [u8],
    offset: usize,
    stride: usize,
    chunk_size: usize,
    format: &'a NegotiatedFormat,
    sequence: u64,
}

impl<'a> FrameView<'a> {
    /// Bytes from the chunk offset to the end of the mapping.
    pub fn payload(&self) -> &'a [u8] {
        self.data.get(self.offset..).unwrap_or(&[])
    }

    /// Row `y`, `stride` bytes long. `None` past the mapped region.
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        let start = self.offset.checked_add((y as usize).checked_mul(self.stride)?)?;
        self.data.get(start..start.checked_add(self.stride)?)
    }

    /// Bytes of the pixel at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Option<&'a [u8]> {
        if x >= self.width() {
            return None;
        }
        let bpp = self.format.format.bytes_per_pixel() as usize;
        let start = (x as usize).checked_mul(bpp)?;
        self.row(y)?.get(start..start + bpp)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes the producer reported as valid.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn width(&self) -> u32 {
        self.format.size.width
    }

    pub fn height(&self) -> u32 {
        self.format.size.height
    }

    pub fn format(&self) -> VideoFormat {
        self.format.format
    }

    pub fn negotiated(&self) -> &'a NegotiatedFormat {
        self.format
    }

    /// Increases by one for every delivered frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

// ── FrameSink ────────────────────────────────────────────────────

/// Receives every successfully mapped frame.
pub trait FrameSink {
    fn on_frame(&mut self, frame: FrameView<'_>);
}

impl<F> FrameSink for F
where
    F: FnMut(FrameView<'_>),
{
    fn on_frame(&mut self, frame: FrameView<'_>) {
        self(frame)
    }
}

// ── FrameChannel ─────────────────────────────────────────────────

/// Counters kept across the life of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub delivered: u64,
    /// Notifications with no buffer to dequeue.
    pub skipped_empty: u64,
    /// Buffers returned without reaching the sink.
    pub dropped: u64,
}

/// What one `process` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Delivered,
    NoBuffer,
    Dropped,
}

#[derive(Debug, Default)]
pub struct FrameChannel {
    stats: FrameStats,
    sequence: u64,
}

impl FrameChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Handle one frame-ready notification.
    ///
    /// Every dequeued buffer is queued back exactly once and every mapping
    /// is unmapped before that. Nothing here is fatal.
    pub fn process<Q, M, S>(
        &mut self,
        queue: &mut Q,
        format: Option<&NegotiatedFormat>,
        mapper: &mut M,
        sink: &mut S,
    ) -> FrameOutcome
    where
        Q: BufferQueue + ?Sized,
        M: MemoryMapper,
        S: FrameSink + ?Sized,
    {
        let Some(buffer) = queue.dequeue() else {
            debug!("out of buffers");
            self.stats.skipped_empty += 1;
            return FrameOutcome::NoBuffer;
        };
        let handle = buffer.handle;

        let outcome = match self.deliver(&buffer, format, mapper, sink) {
            Ok(()) => FrameOutcome::Delivered,
            Err(e) => {
                warn!(buffer = handle.0, "dropping frame: {e}");
                FrameOutcome::Dropped
            }
        };

        if let Err(e) = queue.queue(buffer) {
            warn!(buffer = handle.0, "{e}");
        }

        match outcome {
            FrameOutcome::Delivered => self.stats.delivered += 1,
            _ => self.stats.dropped += 1,
        }
        outcome
    }

    /// Map, sync, call the sink, sync, unmap. Errors before the sink runs
    /// are returned; errors after it are logged.
    fn deliver<M, S>(
        &mut self,
        buffer: &FrameBuffer,
        format: Option<&NegotiatedFormat>,
        mapper: &mut M,
        sink: &mut S,
    ) -> Result<(), FrameError>
    where
        M: MemoryMapper,
        S: FrameSink + ?Sized,
    {
        let plane = buffer.planes.first().ok_or(FrameError::NoPlanes)?;
        let format = format.ok_or(FrameError::NotNegotiated)?;
        if !plane.data_type.is_mappable() {
            return Err(FrameError::UnsupportedDataType(plane.data_type));
        }
        let stride = u32::try_from(plane.chunk.stride)
            .ok()
            .filter(|&s| s > 0)
            .ok_or(FrameError::InvalidStride(plane.chunk.stride))?;

        let height = format.size.height;
        let len = stride
            .checked_mul(height)
            .and_then(|n| n.checked_add(plane.chunk.offset))
            .ok_or(FrameError::LengthOverflow {
                stride,
                height,
                offset: plane.chunk.offset,
            })?;
        if len > plane.max_size {
            return Err(FrameError::PlaneTooSmall {
                len,
                max_size: plane.max_size,
            });
        }
        let len = len as usize;

        debug!(
            buffer = buffer.handle.0,
            fd = plane.fd,
            data_type = %plane.data_type,
            stride,
            size = plane.chunk.size,
            offset = plane.chunk.offset,
            "mapping frame"
        );
        let mapping = mapper.map(plane, len)?;

        if plane.data_type.needs_sync() {
            if let Err(e) = mapper.sync(plane, SyncPhase::Begin) {
                if let Err(unmap) = mapper.unmap(mapping) {
                    warn!("{unmap}");
                }
                return Err(e);
            }
        }

        self.sequence += 1;
        sink.on_frame(FrameView {
            data: mapping.as_ref(),
            offset: plane.chunk.offset as usize,
            stride: stride as usize,
            chunk_size: plane.chunk.size as usize,
            format,
            sequence: self.sequence,
        });

        if plane.data_type.needs_sync() {
            if let Err(e) = mapper.sync(plane, SyncPhase::End) {
                warn!("{e}");
            }
        }
        if let Err(e) = mapper.unmap(mapping) {
            warn!("{e}");
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

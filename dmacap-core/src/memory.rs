//! Read-only mapping of buffer memory.
//!
//! [`MemoryMapper`] is the seam the frame channel maps planes through.
//! [`DmaBufMapper`] is the real implementation: `mmap` of the plane's file
//! descriptor plus `DMA_BUF_IOCTL_SYNC` brackets around CPU access. On
//! platforms without DMA-BUF it refuses every plane.

use crate::error::FrameError;
use crate::frame::DataPlane;

/// Which side of a CPU access a sync directive marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Begin,
    End,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => f.write_str("start"),
            Self::End => f.write_str("end"),
        }
    }
}

/// Maps buffer planes into the process for reading.
pub trait MemoryMapper {
    /// A live mapping. Dropping it unmaps; [`MemoryMapper::unmap`] does the
    /// same but reports failure.
    type Mapping: AsRef<[u8]>;

    /// Map `len` bytes of `plane` starting at its map offset.
    fn map(&mut self, plane: &DataPlane, len: usize) -> Result<Self::Mapping, FrameError>;

    /// Issue a read synchronization directive on the plane's handle.
    fn sync(&mut self, plane: &DataPlane, phase: SyncPhase) -> Result<(), FrameError>;

    fn unmap(&mut self, mapping: Self::Mapping) -> Result<(), FrameError>;
}

pub use imp::{DmaBufMapper, Mapping};

// ── Linux ────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod imp {
    use std::mem::ManuallyDrop;
    use std::num::NonZeroUsize;
    use std::os::fd::BorrowedFd;
    use std::ptr::NonNull;

    use nix::errno::Errno;
    use nix::libc;
    use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
    use nix::unistd::{SysconfVar, sysconf};
    use tracing::{trace, warn};

    use super::{MemoryMapper, SyncPhase};
    use crate::error::FrameError;
    use crate::frame::DataPlane;

    const DMA_BUF_SYNC_READ: u64 = 1 << 0;
    const DMA_BUF_SYNC_START: u64 = 0;
    const DMA_BUF_SYNC_END: u64 = 1 << 2;

    #[repr(C)]
    pub struct DmaBufSync {
        flags: u64,
    }

    nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, DmaBufSync);

    /// A read-only `mmap` region. Unmapped on drop.
    #[derive(Debug)]
    pub struct Mapping {
        base: NonNull<libc::c_void>,
        mapped_len: usize,
        /// Distance from `base` to the plane's map offset.
        skip: usize,
        len: usize,
    }

    impl Mapping {
        fn release(&mut self) -> nix::Result<()> {
            // SAFETY: `base`/`mapped_len` came from a successful mmap and
            // are released exactly once.
            unsafe { munmap(self.base, self.mapped_len) }
        }
    }

    impl AsRef<[u8]> for Mapping {
        fn as_ref(&self) -> &[u8] {
            // SAFETY: the region is mapped PROT_READ for `skip + len` bytes
            // and lives as long as `self`.
            unsafe {
                std::slice::from_raw_parts(
                    self.base.as_ptr().cast::<u8>().add(self.skip),
                    self.len,
                )
            }
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            if let Err(e) = self.release() {
                warn!("munmap on drop failed: {e}");
            }
        }
    }

    /// Maps planes with `mmap(PROT_READ, MAP_SHARED)`.
    #[derive(Debug)]
    pub struct DmaBufMapper {
        page_size: usize,
    }

    impl Default for DmaBufMapper {
        fn default() -> Self {
            let page_size = sysconf(SysconfVar::PAGE_SIZE)
                .ok()
                .flatten()
                .and_then(|v| usize::try_from(v).ok())
                .filter(|&v| v > 0)
                .unwrap_or(4096);
            Self { page_size }
        }
    }

    impl DmaBufMapper {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn borrow_fd(plane: &DataPlane) -> Result<BorrowedFd<'_>, Errno> {
        let raw = i32::try_from(plane.fd).map_err(|_| Errno::EBADF)?;
        if raw < 0 {
            return Err(Errno::EBADF);
        }
        // SAFETY: the server keeps the fd open while the buffer is dequeued,
        // and the borrow does not outlive this call.
        Ok(unsafe { BorrowedFd::borrow_raw(raw) })
    }

    impl MemoryMapper for DmaBufMapper {
        type Mapping = Mapping;

        fn map(&mut self, plane: &DataPlane, len: usize) -> Result<Mapping, FrameError> {
            let map_err = |e: Errno| FrameError::Map {
                fd: plane.fd,
                len,
                source: e.into(),
            };

            let offset = plane.map_offset as usize;
            let skip = offset % self.page_size;
            let aligned = (offset - skip) as libc::off_t;
            let mapped_len = skip
                .checked_add(len)
                .and_then(NonZeroUsize::new)
                .ok_or_else(|| map_err(Errno::EINVAL))?;

            let fd = borrow_fd(plane).map_err(map_err)?;
            // SAFETY: a fresh read-only shared mapping; nothing else aliases
            // it from Rust.
            let base = unsafe {
                mmap(
                    None,
                    mapped_len,
                    ProtFlags::PROT_READ,
                    MapFlags::MAP_SHARED,
                    fd,
                    aligned,
                )
            }
            .map_err(map_err)?;

            trace!(fd = plane.fd, len, offset, "mapped plane");
            Ok(Mapping {
                base,
                mapped_len: mapped_len.get(),
                skip,
                len,
            })
        }

        fn sync(&mut self, plane: &DataPlane, phase: SyncPhase) -> Result<(), FrameError> {
            let flags = DMA_BUF_SYNC_READ
                | match phase {
                    SyncPhase::Begin => DMA_BUF_SYNC_START,
                    SyncPhase::End => DMA_BUF_SYNC_END,
                };
            let sync_err = |e: Errno| FrameError::Sync {
                fd: plane.fd,
                phase,
                source: e.into(),
            };
            let fd = i32::try_from(plane.fd).map_err(|_| sync_err(Errno::EBADF))?;
            let arg = DmaBufSync { flags };
            loop {
                // SAFETY: `arg` is a valid `struct dma_buf_sync` for the
                // duration of the call.
                match unsafe { dma_buf_ioctl_sync(fd, &arg) } {
                    Ok(_) => return Ok(()),
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                    Err(e) => return Err(sync_err(e)),
                }
            }
        }

        fn unmap(&mut self, mapping: Mapping) -> Result<(), FrameError> {
            let mut mapping = ManuallyDrop::new(mapping);
            mapping
                .release()
                .map_err(|e| FrameError::Unmap(e.into()))
        }
    }
}

// ── Other platforms ──────────────────────────────────────────────

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{MemoryMapper, SyncPhase};
    use crate::error::FrameError;
    use crate::frame::DataPlane;

    /// Placeholder; no mapping is possible here.
    #[derive(Debug)]
    pub struct Mapping(Vec<u8>);

    impl AsRef<[u8]> for Mapping {
        fn as_ref(&self) -> &[u8] {
            &self.0
        }
    }

    #[derive(Debug, Default)]
    pub struct DmaBufMapper;

    impl DmaBufMapper {
        pub fn new() -> Self {
            Self
        }
    }

    impl MemoryMapper for DmaBufMapper {
        type Mapping = Mapping;

        fn map(&mut self, _plane: &DataPlane, _len: usize) -> Result<Mapping, FrameError> {
            Err(FrameError::Unsupported("DMA-BUF mapping requires Linux"))
        }

        fn sync(&mut self, _plane: &DataPlane, _phase: SyncPhase) -> Result<(), FrameError> {
            Err(FrameError::Unsupported("DMA-BUF sync requires Linux"))
        }

        fn unmap(&mut self, _mapping: Mapping) -> Result<(), FrameError> {
            Ok(())
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::frame::{Chunk, DataType};

    fn plane_for(file: &std::fs::File, map_offset: u32, len: u32) -> DataPlane {
        DataPlane {
            data_type: DataType::MemFd,
            fd: file.as_raw_fd() as i64,
            map_offset,
            max_size: len,
            chunk: Chunk {
                offset: 0,
                size: len,
                stride: 4,
            },
        }
    }

    fn scratch_file(contents: &[u8]) -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "dmacap-memory-test-{}-{}",
            std::process::id(),
            contents.len()
        ));
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }

    #[test]
    fn maps_file_contents_read_only() {
        let data: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
        let file = scratch_file(&data);
        let mut mapper = DmaBufMapper::new();

        let mapping = mapper.map(&plane_for(&file, 0, 8192), 8192).unwrap();
        assert_eq!(mapping.as_ref(), &data[..]);
        mapper.unmap(mapping).unwrap();
    }

    #[test]
    fn unaligned_map_offset() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let file = scratch_file(&data);
        let mut mapper = DmaBufMapper::new();

        let mapping = mapper.map(&plane_for(&file, 4100, 16), 16).unwrap();
        assert_eq!(mapping.as_ref(), &data[4100..4116]);
    }

    #[test]
    fn bad_fd_is_a_map_error() {
        let mut mapper = DmaBufMapper::new();
        let plane = DataPlane {
            fd: -1,
            ..plane_for(&scratch_file(b"x"), 0, 1)
        };
        assert!(matches!(
            mapper.map(&plane, 1),
            Err(FrameError::Map { fd: -1, .. })
        ));
    }

    #[test]
    fn sync_on_plain_file_fails() {
        let file = scratch_file(&[0; 64]);
        let mut mapper = DmaBufMapper::new();
        let err = mapper
            .sync(&plane_for(&file, 0, 64), SyncPhase::Begin)
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::Sync {
                phase: SyncPhase::Begin,
                ..
            }
        ));
    }
}

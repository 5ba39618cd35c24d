//! [`Transport`] over libpipewire.

use std::cell::RefCell;
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use pipewire as pw;
use pw::main_loop::MainLoop;
use pw::spa::pod::Pod;
use pw::spa::utils::Direction;
use pw::stream::{Stream, StreamListener, StreamRef};
use tracing::{debug, info, warn};

use super::PipeWireOptions;
use crate::error::{CaptureError, FrameError};
use crate::frame::{BufferHandle, Chunk, DataPlane, DataType, FrameBuffer, MetaRecord};
use crate::shutdown;
use crate::transport::{
    BufferQueue, ConnectRequest, StartupWatchdog, StreamControl, StreamHandlers, StreamState,
    Transport,
};

/// How often the loop checks for a stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A PipeWire main loop, its core connection and one capture stream.
pub struct PipeWireTransport {
    options: PipeWireOptions,
    // Field order is teardown order: listener, stream, core, context, loop.
    listener: Option<StreamListener<MainLoop>>,
    stream: Option<Stream>,
    core: Option<pw::core::Core>,
    context: Option<pw::context::Context>,
    mainloop: Option<MainLoop>,
    watchdog: Option<StartupWatchdog>,
}

impl PipeWireTransport {
    /// Initialize libpipewire and connect to the server.
    pub fn new(options: PipeWireOptions) -> Result<Self, CaptureError> {
        pw::init();

        let connection = |e: pw::Error| CaptureError::Connection(e.to_string());
        let mainloop = MainLoop::new(None).map_err(connection)?;
        let context = pw::context::Context::new(&mainloop).map_err(connection)?;
        let core = match options.remote_fd {
            Some(fd) => {
                // SAFETY: the caller hands over an open descriptor it no
                // longer uses; we become its only owner.
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                context.connect_fd(fd, None).map_err(connection)?
            }
            None => context.connect(None).map_err(connection)?,
        };
        info!(remote_fd = ?options.remote_fd, "connected to pipewire");

        Ok(Self {
            options,
            listener: None,
            stream: None,
            core: Some(core),
            context: Some(context),
            mainloop: Some(mainloop),
            watchdog: None,
        })
    }
}

impl Transport for PipeWireTransport {
    fn connect(
        &mut self,
        request: ConnectRequest,
        handlers: StreamHandlers,
    ) -> Result<(), CaptureError> {
        let (Some(core), Some(mainloop)) = (self.core.as_ref(), self.mainloop.as_ref()) else {
            return Err(CaptureError::Connection("transport already shut down".into()));
        };
        let connection = |e: pw::Error| CaptureError::Connection(e.to_string());

        let mut props = pw::properties::Properties::new();
        props.insert(*pw::keys::MEDIA_TYPE, "Video");
        props.insert(*pw::keys::MEDIA_CATEGORY, "Capture");
        props.insert(*pw::keys::MEDIA_ROLE, self.options.media_role.as_str());
        let stream = Stream::new(core, &self.options.name, props).map_err(connection)?;

        let StreamHandlers {
            mut state_changed,
            mut param_changed,
            mut process,
            watchdog,
        } = handlers;

        let listener = stream
            .add_local_listener_with_user_data(mainloop.clone())
            .state_changed(move |stream, mainloop, old, new| {
                let mut control = Control { stream, mainloop };
                state_changed(&convert_state(old), &convert_state(new), &mut control);
            })
            .param_changed(move |stream, mainloop, id, param| {
                let mut control = Control { stream, mainloop };
                param_changed(id, param.map(Pod::as_bytes), &mut control);
            })
            .process(move |stream, mainloop| {
                let mut control = Control { stream, mainloop };
                process(&mut Queue { stream }, &mut control);
            })
            .register()
            .map_err(connection)?;

        let mut pods = as_pods(&request.params)?;
        let flags = pw::stream::StreamFlags::from_bits_truncate(request.flags.bits());
        stream
            .connect(Direction::Input, request.target, flags, &mut pods)
            .map_err(connection)?;
        debug!(target = ?request.target, params = pods.len(), "stream connect requested");

        self.listener = Some(listener);
        self.stream = Some(stream);
        self.watchdog = watchdog;
        Ok(())
    }

    fn run(&mut self) -> i32 {
        let Some(mainloop) = self.mainloop.as_ref() else {
            return 1;
        };

        let timer = self.watchdog.take().map(|watchdog| {
            let timeout = watchdog.timeout;
            let on_expired = RefCell::new(watchdog.on_expired);
            let quit = mainloop.clone();
            let timer = mainloop.loop_().add_timer(move |_| {
                if (on_expired.borrow_mut())() {
                    quit.quit();
                }
            });
            if let Err(e) = timer.update_timer(Some(timeout), None).into_result() {
                warn!("failed to arm startup watchdog: {e}");
            }
            timer
        });

        let quit = mainloop.clone();
        let stop_poll = mainloop.loop_().add_timer(move |_| {
            if shutdown::requested() {
                info!("stop requested");
                quit.quit();
            }
        });
        if let Err(e) = stop_poll
            .update_timer(Some(STOP_POLL_INTERVAL), Some(STOP_POLL_INTERVAL))
            .into_result()
        {
            warn!("failed to arm stop poll: {e}");
        }

        if !shutdown::requested() {
            mainloop.run();
        }
        drop(stop_poll);
        drop(timer);
        0
    }

    fn shutdown(&mut self) {
        self.listener = None;
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.disconnect() {
                debug!("stream disconnect: {e}");
            }
        }
        self.core = None;
        self.context = None;
        self.mainloop = None;
    }
}

impl Drop for PipeWireTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn convert_state(state: pw::stream::StreamState) -> StreamState {
    match state {
        pw::stream::StreamState::Error(msg) => StreamState::Error(msg),
        pw::stream::StreamState::Unconnected => StreamState::Unconnected,
        pw::stream::StreamState::Connecting => StreamState::Connecting,
        pw::stream::StreamState::Paused => StreamState::Paused,
        pw::stream::StreamState::Streaming => StreamState::Streaming,
    }
}

fn as_pods(params: &[Vec<u8>]) -> Result<Vec<&Pod>, CaptureError> {
    params
        .iter()
        .map(|bytes| {
            Pod::from_bytes(bytes).ok_or(CaptureError::Transport("malformed parameter pod".into()))
        })
        .collect()
}

// ── Callback adapters ────────────────────────────────────────────

struct Control<'a> {
    stream: &'a StreamRef,
    mainloop: &'a MainLoop,
}

impl StreamControl for Control<'_> {
    fn update_params(&mut self, params: &[Vec<u8>]) -> Result<(), CaptureError> {
        let mut pods = as_pods(params)?;
        self.stream
            .update_params(&mut pods)
            .map_err(|e| CaptureError::Transport(e.to_string()))
    }

    fn stop(&mut self) {
        self.mainloop.quit();
    }
}

struct Queue<'a> {
    stream: &'a StreamRef,
}

impl BufferQueue for Queue<'_> {
    fn dequeue(&mut self) -> Option<FrameBuffer> {
        // SAFETY: called from the process callback on the loop thread.
        let raw = unsafe { self.stream.dequeue_raw_buffer() };
        if raw.is_null() {
            return None;
        }
        // SAFETY: a non-null dequeued buffer stays valid until queued back.
        Some(unsafe { describe(raw) })
    }

    fn queue(&mut self, buffer: FrameBuffer) -> Result<(), FrameError> {
        let raw = buffer.handle.0 as *mut pw::sys::pw_buffer;
        if raw.is_null() {
            return Err(FrameError::Release("null buffer handle".into()));
        }
        // SAFETY: the handle was produced by `dequeue` on this stream and
        // is returned exactly once.
        unsafe { self.stream.queue_raw_buffer(raw) };
        Ok(())
    }
}

/// Copy the plane and meta descriptions out of a dequeued buffer.
///
/// # Safety
/// `raw` must be a live buffer dequeued from a stream.
unsafe fn describe(raw: *mut pw::sys::pw_buffer) -> FrameBuffer {
    let mut planes = Vec::new();
    let mut metas = Vec::new();

    let spa_buffer = unsafe { (*raw).buffer };
    if !spa_buffer.is_null() {
        let b = unsafe { &*spa_buffer };
        if !b.datas.is_null() {
            let datas = unsafe { std::slice::from_raw_parts(b.datas, b.n_datas as usize) };
            for d in datas {
                let chunk = if d.chunk.is_null() {
                    Chunk::default()
                } else {
                    let c = unsafe { &*d.chunk };
                    Chunk {
                        offset: c.offset,
                        size: c.size,
                        stride: c.stride,
                    }
                };
                planes.push(DataPlane {
                    data_type: DataType::from_raw(d.type_),
                    fd: d.fd,
                    map_offset: d.mapoffset,
                    max_size: d.maxsize,
                    chunk,
                });
            }
        }
        if !b.metas.is_null() {
            let raw_metas = unsafe { std::slice::from_raw_parts(b.metas, b.n_metas as usize) };
            metas.extend(raw_metas.iter().map(|m| MetaRecord {
                meta_type: m.type_,
                size: m.size,
            }));
        }
    }

    FrameBuffer {
        handle: BufferHandle(raw as usize),
        planes,
        metas,
    }
}

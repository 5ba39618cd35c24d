//! One capture session from connect to shutdown.
//!
//! [`SessionController`] builds the format catalog, connects through a
//! [`Transport`], blocks in its loop, and turns whatever happened into a
//! [`SessionOutcome`]. The transport callbacks share a [`Session`] through
//! `Rc<RefCell<_>>`; the loop is single-threaded so no locking is needed.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::error::CaptureError;
use crate::format::FormatCatalog;
use crate::frame::{FrameChannel, FrameSink, FrameStats};
use crate::memory::{DmaBufMapper, MemoryMapper};
use crate::negotiate::{BufferPolicy, ParamNegotiator, ParamOutcome};
use crate::state::{Failure, NegotiationPhase, SessionPhase};
use crate::transport::{
    BufferQueue, ConnectRequest, StartupWatchdog, StreamControl, StreamFlags, StreamHandlers,
    StreamState, Transport,
};

// ── SessionConfig ────────────────────────────────────────────────

/// Everything needed to start a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Node to capture. `None` lets the server choose.
    pub target: Option<u32>,
    pub flags: StreamFlags,
    pub catalog: FormatCatalog,
    pub buffers: BufferPolicy,
    /// Fail the session if it is not streaming after this long.
    pub startup_timeout: Option<Duration>,
}

// ── SessionOutcome ───────────────────────────────────────────────

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The loop stopped after a format was negotiated.
    Completed,
    /// The loop stopped cleanly but no format was ever agreed.
    NeverNegotiated,
    Failed(Failure),
}

impl SessionOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::NeverNegotiated => 4,
            Self::Failed(f) => f.kind.exit_code(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::NeverNegotiated => write!(f, "stopped before a format was negotiated"),
            Self::Failed(failure) => write!(f, "failed: {}", failure.message),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// State shared by the stream callbacks.
pub struct Session<M, S> {
    phase: SessionPhase,
    negotiator: ParamNegotiator,
    channel: FrameChannel,
    mapper: M,
    sink: S,
}

impl<M, S> Session<M, S>
where
    M: MemoryMapper,
    S: FrameSink,
{
    pub fn new(buffers: BufferPolicy, mapper: M, sink: S) -> Self {
        Self {
            phase: SessionPhase::default(),
            negotiator: ParamNegotiator::new(buffers),
            channel: FrameChannel::new(),
            mapper,
            sink,
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn negotiation(&self) -> NegotiationPhase {
        self.negotiator.phase()
    }

    pub fn stats(&self) -> FrameStats {
        self.channel.stats()
    }

    pub fn on_state_changed(
        &mut self,
        old: &StreamState,
        new: &StreamState,
        control: &mut dyn StreamControl,
    ) {
        info!("stream state: {old} -> {new}");
        if self.phase.is_terminal() {
            return;
        }

        match new {
            StreamState::Error(msg) => {
                self.fail(CaptureError::Transport(msg.clone()), control);
            }
            StreamState::Unconnected => {
                if matches!(
                    self.phase,
                    SessionPhase::Negotiating | SessionPhase::Streaming { .. }
                ) {
                    self.fail(CaptureError::ConnectionLost, control);
                }
            }
            StreamState::Paused => {
                if self.phase.is_streaming() {
                    self.transition(SessionPhase::begin_negotiation, control);
                }
            }
            StreamState::Streaming => {
                if self.phase == SessionPhase::Negotiating {
                    self.transition(SessionPhase::begin_streaming, control);
                }
                if self.negotiator.mark_buffers_ready() {
                    debug!("buffers ready");
                }
            }
            StreamState::Connecting => {}
        }
    }

    pub fn on_param_changed(
        &mut self,
        id: u32,
        param: Option<&[u8]>,
        control: &mut dyn StreamControl,
    ) {
        if self.phase.is_terminal() {
            trace!(id, "session ended; ignoring param");
            return;
        }
        match self.negotiator.on_param_changed(id, param, control) {
            Ok(ParamOutcome::Submitted(_)) | Ok(ParamOutcome::Ignored) => {}
            Ok(ParamOutcome::Malformed) => {
                debug!(phase = %self.negotiator.phase(), "waiting for a new proposal");
            }
            Err(e) => self.fail(e, control),
        }
    }

    pub fn on_process(&mut self, queue: &mut dyn BufferQueue, _control: &mut dyn StreamControl) {
        if self.negotiator.phase() == NegotiationPhase::ParamsSubmitted
            && self.negotiator.mark_buffers_ready()
        {
            debug!("buffers ready (first frame)");
        }
        self.channel.process(
            queue,
            self.negotiator.format(),
            &mut self.mapper,
            &mut self.sink,
        );
    }

    /// Returns `true` if the loop should stop.
    pub fn on_startup_expired(&mut self, timeout: Duration) -> bool {
        if self.phase.is_streaming() || self.phase.is_terminal() {
            return false;
        }
        self.record_failure(&CaptureError::StartupTimeout(timeout));
        true
    }

    fn transition(
        &mut self,
        step: fn(&mut SessionPhase) -> Result<(), CaptureError>,
        control: &mut dyn StreamControl,
    ) {
        if let Err(e) = step(&mut self.phase) {
            self.fail(e, control);
        }
    }

    fn fail(&mut self, e: CaptureError, control: &mut dyn StreamControl) {
        self.record_failure(&e);
        control.stop();
    }

    fn record_failure(&mut self, e: &CaptureError) {
        error!("session failed in {}: {e}", self.phase);
        if let Err(t) = self.phase.fail(Failure::from(e)) {
            warn!("{t}");
        }
    }

    /// The outcome for the current phase; meaningful once the loop returned.
    fn outcome(&self) -> SessionOutcome {
        match &self.phase {
            SessionPhase::Failed(f) => SessionOutcome::Failed(f.clone()),
            _ if self.negotiator.format().is_none() => SessionOutcome::NeverNegotiated,
            _ => SessionOutcome::Completed,
        }
    }
}

impl<M, S> Session<M, S>
where
    M: MemoryMapper + 'static,
    S: FrameSink + 'static,
{
    /// Build the callback table for `session`.
    pub fn handlers(
        session: &Rc<RefCell<Self>>,
        startup_timeout: Option<Duration>,
    ) -> StreamHandlers {
        let state = Rc::clone(session);
        let param = Rc::clone(session);
        let process = Rc::clone(session);

        let watchdog = startup_timeout.map(|timeout| {
            let session = Rc::clone(session);
            StartupWatchdog {
                timeout,
                on_expired: Box::new(move || match session.try_borrow_mut() {
                    Ok(mut s) => s.on_startup_expired(timeout),
                    Err(_) => false,
                }),
            }
        });

        StreamHandlers {
            state_changed: Box::new(move |old, new, control| match state.try_borrow_mut() {
                Ok(mut s) => s.on_state_changed(old, new, control),
                Err(_) => warn!("re-entrant state callback ignored"),
            }),
            param_changed: Box::new(move |id, pod, control| match param.try_borrow_mut() {
                Ok(mut s) => s.on_param_changed(id, pod, control),
                Err(_) => warn!("re-entrant param callback ignored"),
            }),
            process: Box::new(move |queue, control| match process.try_borrow_mut() {
                Ok(mut s) => s.on_process(queue, control),
                Err(_) => warn!("re-entrant process callback ignored"),
            }),
            watchdog,
        }
    }
}

// ── SessionController ────────────────────────────────────────────

/// Drives one session over a transport.
pub struct SessionController<T> {
    transport: T,
    config: SessionConfig,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self { transport, config }
    }

    /// Run with the platform's DMA-BUF mapper.
    pub fn run<S: FrameSink + 'static>(self, sink: S) -> SessionOutcome {
        self.run_with_mapper(DmaBufMapper::new(), sink)
    }

    /// Connect, block until the loop stops, shut down.
    pub fn run_with_mapper<M, S>(mut self, mapper: M, sink: S) -> SessionOutcome
    where
        M: MemoryMapper + 'static,
        S: FrameSink + 'static,
    {
        let session = Rc::new(RefCell::new(Session::new(self.config.buffers, mapper, sink)));

        if let Err(e) = self.connect(&session) {
            session.borrow_mut().record_failure(&e);
            self.transport.shutdown();
            return session.borrow().outcome();
        }

        let code = self.transport.run();
        debug!(code, "loop returned");

        let outcome = {
            let mut s = session.borrow_mut();
            if code != 0 && !s.phase.is_terminal() {
                s.record_failure(&CaptureError::Transport(format!(
                    "loop exited with code {code}"
                )));
            }
            if !s.phase.is_terminal() {
                if let Err(e) = s.phase.stop() {
                    warn!("{e}");
                }
            }
            let stats = s.stats();
            info!(
                delivered = stats.delivered,
                dropped = stats.dropped,
                skipped = stats.skipped_empty,
                "session finished"
            );
            s.outcome()
        };

        self.transport.shutdown();
        outcome
    }

    fn connect<M, S>(&mut self, session: &Rc<RefCell<Session<M, S>>>) -> Result<(), CaptureError>
    where
        M: MemoryMapper + 'static,
        S: FrameSink + 'static,
    {
        if !self.config.buffers.is_consistent() {
            return Err(CaptureError::InvalidCatalog("inconsistent buffer policy"));
        }
        session.borrow_mut().phase.begin_connect()?;

        let params = self.config.catalog.encode()?;
        info!(
            target = ?self.config.target,
            formats = params.len(),
            "connecting capture stream"
        );
        let request = ConnectRequest {
            target: self.config.target,
            flags: self.config.flags,
            params,
        };
        let handlers = Session::handlers(session, self.config.startup_timeout);
        self.transport.connect(request, handlers)?;

        let mut s = session.borrow_mut();
        if s.phase == SessionPhase::Connecting {
            s.phase.begin_negotiation()?;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::frame::{DataPlane, FrameBuffer, FrameView};
    use crate::memory::SyncPhase;
    use crate::state::FailureKind;

    struct NoMapper;

    impl MemoryMapper for NoMapper {
        type Mapping = Vec<u8>;

        fn map(&mut self, _: &DataPlane, _: usize) -> Result<Vec<u8>, FrameError> {
            Err(FrameError::Unsupported("test"))
        }

        fn sync(&mut self, _: &DataPlane, _: SyncPhase) -> Result<(), FrameError> {
            Ok(())
        }

        fn unmap(&mut self, _: Vec<u8>) -> Result<(), FrameError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Control {
        stopped: bool,
    }

    impl StreamControl for Control {
        fn update_params(&mut self, _: &[Vec<u8>]) -> Result<(), CaptureError> {
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped = true;
        }
    }

    struct EmptyQueue;

    impl BufferQueue for EmptyQueue {
        fn dequeue(&mut self) -> Option<FrameBuffer> {
            None
        }

        fn queue(&mut self, _: FrameBuffer) -> Result<(), FrameError> {
            Ok(())
        }
    }

    fn ignore(_: FrameView<'_>) {}

    fn negotiating() -> Session<NoMapper, fn(FrameView<'_>)> {
        let mut s = Session::new(BufferPolicy::default(), NoMapper, ignore as fn(FrameView<'_>));
        s.phase = SessionPhase::Negotiating;
        s
    }

    #[test]
    fn transport_error_is_fatal() {
        let mut s = negotiating();
        let mut control = Control::default();
        s.on_state_changed(
            &StreamState::Paused,
            &StreamState::Error("node gone".into()),
            &mut control,
        );
        assert!(control.stopped);
        let failure = s.phase().failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Transport);
        assert!(failure.message.contains("node gone"));
        assert_eq!(s.outcome().exit_code(), 3);
    }

    #[test]
    fn unconnected_after_connect_is_connection_loss() {
        let mut s = negotiating();
        let mut control = Control::default();
        s.on_state_changed(&StreamState::Paused, &StreamState::Unconnected, &mut control);
        assert!(control.stopped);
        assert_eq!(
            s.phase().failure().map(|f| f.kind),
            Some(FailureKind::Transport)
        );
    }

    #[test]
    fn pause_while_streaming_renegotiates() {
        let mut s = negotiating();
        let mut control = Control::default();
        s.on_state_changed(&StreamState::Paused, &StreamState::Streaming, &mut control);
        assert!(s.phase().is_streaming());
        s.on_state_changed(&StreamState::Streaming, &StreamState::Paused, &mut control);
        assert_eq!(s.phase(), &SessionPhase::Negotiating);
        assert!(!control.stopped);
    }

    #[test]
    fn watchdog_only_fires_before_streaming() {
        let mut s = negotiating();
        assert!(s.on_startup_expired(Duration::from_secs(2)));
        assert_eq!(s.outcome().exit_code(), 5);

        let mut s = negotiating();
        let mut control = Control::default();
        s.on_state_changed(&StreamState::Paused, &StreamState::Streaming, &mut control);
        assert!(!s.on_startup_expired(Duration::from_secs(2)));
    }

    #[test]
    fn empty_process_keeps_streaming() {
        let mut s = negotiating();
        let mut control = Control::default();
        s.on_state_changed(&StreamState::Paused, &StreamState::Streaming, &mut control);
        s.on_process(&mut EmptyQueue, &mut control);
        assert!(s.phase().is_streaming());
        assert_eq!(s.stats().skipped_empty, 1);
    }

    #[test]
    fn outcome_exit_codes() {
        assert_eq!(SessionOutcome::Completed.exit_code(), 0);
        assert_eq!(SessionOutcome::NeverNegotiated.exit_code(), 4);
        let failed = SessionOutcome::Failed(Failure {
            kind: FailureKind::Negotiation,
            message: "rejected".into(),
        });
        assert_eq!(failed.exit_code(), 2);
        assert!(!failed.is_success());
    }
}

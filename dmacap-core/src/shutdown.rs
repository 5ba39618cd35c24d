//! Stop requests delivered by `SIGINT` and `SIGTERM`.
//!
//! The handler only sets a flag. Transports poll [`requested`] from their
//! event loop and return normally, so the session still tears the stream
//! down and reports a clean outcome.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CaptureError;

static REQUESTED: AtomicBool = AtomicBool::new(false);

/// Ask the running session to stop at the next loop iteration.
pub fn request() {
    REQUESTED.store(true, Ordering::Release);
}

/// Whether a stop has been requested.
pub fn requested() -> bool {
    REQUESTED.load(Ordering::Acquire)
}

/// Route `SIGINT` and `SIGTERM` to [`request`].
#[cfg(target_os = "linux")]
pub fn install() -> Result<(), CaptureError> {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_signal(_: std::ffi::c_int) {
        REQUESTED.store(true, Ordering::Release);
    }

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| CaptureError::Io(std::io::Error::from(e)))?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn install() -> Result<(), CaptureError> {
    Err(CaptureError::Unsupported("signal handling requires Linux"))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal, raise};

    #[test]
    fn sigterm_becomes_a_stop_request() {
        install().unwrap();
        raise(Signal::SIGTERM).unwrap();
        assert!(requested());
        request();
        assert!(requested());
    }
}

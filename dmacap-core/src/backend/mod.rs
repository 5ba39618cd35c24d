//! Concrete transports.
//!
//! The PipeWire backend is compiled only with the `pipewire` feature.
//! Without it, [`PipeWireTransport::new`] fails with
//! [`CaptureError::Unsupported`] so callers need no `cfg` of their own.

#[cfg(feature = "pipewire")]
mod pipewire;

#[cfg(feature = "pipewire")]
pub use self::pipewire::PipeWireTransport;

#[cfg(not(feature = "pipewire"))]
pub use self::stub::PipeWireTransport;

/// How to reach the server and label the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeWireOptions {
    /// Stream name shown in the graph.
    pub name: String,
    /// `media.role` property.
    pub media_role: String,
    /// An already-open connection to the server (e.g. handed out by the
    /// screencast portal). The transport takes ownership of it.
    pub remote_fd: Option<i32>,
}

impl Default for PipeWireOptions {
    fn default() -> Self {
        Self {
            name: "dmacap".into(),
            media_role: "Screen".into(),
            remote_fd: None,
        }
    }
}

#[cfg(not(feature = "pipewire"))]
mod stub {
    use super::PipeWireOptions;
    use crate::error::CaptureError;
    use crate::transport::{ConnectRequest, StreamHandlers, Transport};

    /// Placeholder when built without the `pipewire` feature.
    #[derive(Debug)]
    pub struct PipeWireTransport {
        _private: (),
    }

    impl PipeWireTransport {
        pub fn new(_options: PipeWireOptions) -> Result<Self, CaptureError> {
            Err(CaptureError::Unsupported(
                "built without the `pipewire` feature",
            ))
        }
    }

    impl Transport for PipeWireTransport {
        fn connect(
            &mut self,
            _request: ConnectRequest,
            _handlers: StreamHandlers,
        ) -> Result<(), CaptureError> {
            Err(CaptureError::Unsupported(
                "built without the `pipewire` feature",
            ))
        }

        fn run(&mut self) -> i32 {
            1
        }

        fn shutdown(&mut self) {}
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn new_is_unsupported() {
            let err = PipeWireTransport::new(PipeWireOptions::default()).unwrap_err();
            assert!(matches!(err, CaptureError::Unsupported(_)));
            assert_eq!(err.exit_code(), 1);
        }
    }
}

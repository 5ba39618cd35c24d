//! A frame sink that only reports what it sees.

use std::time::{Duration, Instant};

use dmacap_core::{FrameSink, FrameView};
use tracing::{debug, info, trace};

/// Logs the first pixel of every frame at `trace` and the delivery rate
/// at `info` once per interval.
pub struct LoggingSink {
    interval: Duration,
    window_start: Option<Instant>,
    window_frames: u64,
    total: u64,
}

impl LoggingSink {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            window_frames: 0,
            total: 0,
        }
    }

    /// Frames received so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn tick(&mut self, now: Instant) -> Option<f64> {
        self.total += 1;
        self.window_frames += 1;
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.duration_since(start);
        if elapsed < self.interval {
            return None;
        }
        let fps = self.window_frames as f64 / elapsed.as_secs_f64();
        self.window_start = Some(now);
        self.window_frames = 0;
        Some(fps)
    }
}

impl Default for LoggingSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl FrameSink for LoggingSink {
    fn on_frame(&mut self, frame: FrameView<'_>) {
        if frame.sequence() == 1 {
            debug!(
                "first frame: {} {}x{}, stride {}",
                frame.format(),
                frame.width(),
                frame.height(),
                frame.stride()
            );
        }
        if let Some(px) = frame.pixel(0, 0) {
            trace!(seq = frame.sequence(), "pixel(0,0) = {px:02x?}");
        }
        if let Some(fps) = self.tick(Instant::now()) {
            info!(frames = self.total, "{fps:.1} fps");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_reported_once_per_interval() {
        let mut sink = LoggingSink::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert_eq!(sink.tick(t0), None);
        assert_eq!(sink.tick(t0 + Duration::from_millis(500)), None);
        let fps = sink.tick(t0 + Duration::from_secs(1)).unwrap();
        assert!((fps - 3.0).abs() < 1e-9);
        assert_eq!(sink.tick(t0 + Duration::from_millis(1500)), None);
        assert_eq!(sink.total(), 4);
    }
}

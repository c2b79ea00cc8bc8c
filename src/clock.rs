//! Monotonic millisecond clock used for all sample and message timestamps.

use std::time::Instant;

/// Monotonic clock anchored at process startup.
///
/// All timestamps in the system (sample ticks, message times, recording
/// start) are milliseconds read from one instance of this clock, so they are
/// mutually comparable and unaffected by wall-clock adjustments.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

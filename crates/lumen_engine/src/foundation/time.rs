//! Time management utilities

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Measures the interval between successive ticks of a loop
pub struct Timer {
    last_tick: Instant,
    delta_time: f64,
    tick_count: u64,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Create a new timer starting now
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
            delta_time: 0.0,
            tick_count: 0,
        }
    }

    /// Mark the end of a tick and return its duration in seconds
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        self.delta_time = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        self.tick_count += 1;
        self.delta_time
    }

    /// Duration of the last completed tick in seconds
    pub fn delta_time(&self) -> f64 {
        self.delta_time
    }

    /// Number of completed ticks
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Time elapsed since the last tick
    pub fn since_last_tick(&self) -> Duration {
        self.last_tick.elapsed()
    }
}

/// An `f64` that can be shared between threads without a lock
#[derive(Debug, Default)]
struct AtomicSeconds(AtomicU64);

impl AtomicSeconds {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, seconds: f64) {
        self.0.store(seconds.to_bits(), Ordering::Relaxed);
    }
}

/// Timing published by the update and render threads for the host to read
#[derive(Debug, Default)]
pub struct FrameTiming {
    update_delta: AtomicSeconds,
    frame_time: AtomicSeconds,
    frames: AtomicU64,
}

impl FrameTiming {
    /// Create zeroed timing
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration of the last update tick in seconds
    pub fn update_delta(&self) -> f64 {
        self.update_delta.load()
    }

    /// Record the duration of an update tick
    pub fn set_update_delta(&self, seconds: f64) {
        self.update_delta.store(seconds);
    }

    /// Duration of the last completed render frame in seconds
    pub fn frame_time(&self) -> f64 {
        self.frame_time.load()
    }

    /// Record the duration of a completed render frame
    pub fn record_frame(&self, seconds: f64) {
        self.frame_time.store(seconds);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of frames recorded so far
    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn timing_round_trips_seconds() {
        let timing = FrameTiming::new();
        assert_relative_eq!(timing.frame_time(), 0.0);

        timing.set_update_delta(1.0 / 900.0);
        timing.record_frame(0.016);
        timing.record_frame(0.017);

        assert_relative_eq!(timing.update_delta(), 1.0 / 900.0);
        assert_relative_eq!(timing.frame_time(), 0.017);
        assert_eq!(timing.frames_rendered(), 2);
    }

    #[test]
    fn timer_counts_ticks() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(2));
        let dt = timer.tick();
        assert!(dt >= 0.002);
        assert_relative_eq!(timer.delta_time(), dt);
        assert_eq!(timer.tick_count(), 1);
    }
}

//! Fixed-rate tick clock.
//!
//! Frames arrive at whatever rate the host loop runs; simulation ticks run at
//! a fixed interval. Unconsumed frame time carries forward in a remainder, so
//! the total tick count depends only on the total elapsed time, not on how it
//! was split across frames.

/// Accumulates frame time and converts it into whole simulation ticks.
#[derive(Debug, Clone)]
pub struct TickClock {
    interval: f64,
    remainder: f64,
    tick_count: u32,
}

impl TickClock {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            interval: 1.0 / f64::from(tick_rate.max(1)),
            remainder: 0.0,
            tick_count: 0,
        }
    }

    /// Seconds per tick.
    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Ticks completed since startup.
    pub fn tick_count(&self) -> u32 {
        self.tick_count
    }

    /// Folds `frame_dt` into the remainder and returns how many whole ticks
    /// it now covers, consuming that much time. Returns 0 on render-only
    /// frames.
    pub fn advance(&mut self, frame_dt: f64) -> u32 {
        self.remainder += frame_dt.max(0.0);
        if self.remainder < self.interval {
            return 0;
        }
        let num_ticks = (self.remainder / self.interval) as u32;
        self.remainder -= f64::from(num_ticks) * self.interval;
        num_ticks
    }

    /// Virtual time at the start of the tick currently executing. Set once
    /// per tick; every object update within the tick observes the same value.
    pub fn tick_start_time(&self) -> f64 {
        f64::from(self.tick_count) * self.interval
    }

    /// Marks the current tick complete.
    pub fn complete_tick(&mut self) {
        self.tick_count += 1;
    }

    /// Virtual time for frame-bound (non-tick) consumers, restored after the
    /// tick loop: completed ticks plus the unconsumed remainder.
    pub fn frame_time(&self) -> f64 {
        f64::from(self.tick_count) * self.interval + self.remainder
    }
}

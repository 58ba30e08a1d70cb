//! Monotonic tick source.
//!
//! `Tick` is a 32-bit unsigned counter with 1ms nominal resolution.
//! Comparisons must tolerate wraparound, so callers use [`Tick::wrapping_diff`]
//! rather than plain subtraction whenever a sign matters (interview/pending
//! deadline checks in particular run for the lifetime of the process and
//! will eventually cross the wrap boundary).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A monotonic tick count. Wraps after `u32::MAX`.
pub type Tick = u32;

/// Computes `now - since` as a signed 32-bit quantity, correct across wrap.
///
/// Mirrors the source firmware's tick-compare idiom: `(int32_t)(now - since)`.
pub fn wrapping_diff(now: Tick, since: Tick) -> i32 {
  now.wrapping_sub(since) as i32
}

/// Shared, thread-safe tick counter. The radio stack's native thread may
/// read `now_ticks()` without taking any lock; only `tick_advance` mutates it.
#[derive(Debug, Clone)]
pub struct Clock {
  ticks: Arc<AtomicU32>,
}

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock {
  pub fn new() -> Self {
    Clock {
      ticks: Arc::new(AtomicU32::new(0)),
    }
  }

  /// Current tick value.
  pub fn now_ticks(&self) -> Tick {
    self.ticks.load(Ordering::Acquire)
  }

  /// Uptime in milliseconds (1 tick == 1ms nominal resolution).
  pub fn uptime_ms(&self) -> u32 {
    self.now_ticks()
  }

  /// Advance the clock by one or more ticks. Driven by an external timer
  /// source (a platform timer ISR in the original firmware; a background
  /// thread or explicit test driver here).
  pub fn tick_advance(&self, by: u32) {
    self.ticks.fetch_add(by, Ordering::AcqRel);
  }
}

use crate::Tick;
use std::time::{Duration, Instant};

/// Fixed-rate tick counter.
///
/// Each crossing advances the reference point by exactly one interval
/// rather than to "now", so scheduling jitter never accumulates into drift.
/// After a stall the clock catches up one tick per call.
#[derive(Debug, Clone)]
pub struct TickClock {
    interval: Duration,
    reference: Instant,
    tick: Tick,
}

impl TickClock {
    pub fn new(tick_rate: u32, start_tick: Tick, now: Instant) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64),
            reference: now,
            tick: start_tick,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Hard resynchronisation, used by followers on heartbeat.
    pub fn set_tick(&mut self, tick: Tick) {
        self.tick = tick;
    }

    pub fn next_deadline(&self) -> Instant {
        self.reference + self.interval
    }

    /// Advances by one tick if the next deadline has passed.
    pub fn try_advance(&mut self, now: Instant) -> Option<Tick> {
        if now < self.next_deadline() {
            return None;
        }
        self.reference += self.interval;
        self.tick += 1;
        Some(self.tick)
    }
}

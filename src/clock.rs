//! Logical tick clock and deadlines
//!
//! There is no hardware timer in the core: time advances by one tick for
//! every unit of work the scheduler charges to a task.

/// Logical clock
#[derive(Debug, Clone, Copy, Default)]
pub struct TickClock {
    /// Ticks charged so far
    ticks: u64,
}

impl TickClock {
    /// Clock starting at tick 0
    pub const fn new() -> Self {
        Self { ticks: 0 }
    }

    /// Charge `ticks` units of work
    pub fn advance(&mut self, ticks: u64) {
        self.ticks = self.ticks.wrapping_add(ticks);
    }

    /// Current tick
    pub fn now(&self) -> u64 {
        self.ticks
    }

    /// Ticks elapsed since a reference point
    pub fn elapsed_since(&self, reference: u64) -> u64 {
        self.ticks.wrapping_sub(reference)
    }
}

/// Deadline of one activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// Release tick of the activation
    release: u64,
    /// Relative deadline
    relative: u64,
}

impl Deadline {
    /// Deadline `relative` ticks after `release`
    pub fn new(release: u64, relative: u64) -> Self {
        Self { release, relative }
    }

    /// Absolute tick the activation must finish by
    pub fn due(&self) -> u64 {
        self.release.saturating_add(self.relative)
    }

    /// Release tick of the activation
    pub fn release(&self) -> u64 {
        self.release
    }

    /// Check if deadline is met
    pub fn is_met(&self, current: u64) -> bool {
        current <= self.due()
    }

    /// Remaining ticks until deadline (0 if missed)
    pub fn remaining(&self, current: u64) -> u64 {
        self.due().saturating_sub(current)
    }

    /// Move to the next release of a periodic task
    pub fn next_period(&mut self, period: u64) {
        self.release = self.release.saturating_add(period);
    }
}

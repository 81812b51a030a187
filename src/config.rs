//! Static capacities and tunables
//!
//! Every table in the core is sized here so nothing allocates after startup.

use core::time::Duration;

/// Maximum tasks the scheduler can manage
pub const MAX_TASKS: usize = 16;

/// Task name length in bytes (longer names are truncated)
pub const NAME_LEN: usize = 16;

/// Default slot count of each interrupt ring (power of two)
pub const RING_CAPACITY: usize = 64;

/// Interrupt classes the kernel side can hold registrations for
pub const MAX_CLASSES: usize = 16;

/// Outstanding I/O requests the kernel side tracks for correlation
pub const MAX_IN_FLIGHT: usize = 64;

/// Responses the user side buffers after draining the response ring
pub const PENDING_RESPONSES: usize = 16;

/// Completions the kernel side holds while the response ring is full
pub const COMPLETION_BACKLOG: usize = 32;

/// Base quantum in ticks when nothing else is configured
pub const BASE_QUANTUM: u32 = 10;

/// Scheduler tunables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Quantum (ticks) a task gets at zero load
    pub base_quantum: u32,
    /// Upper clamp for sampled system load
    pub max_load: f32,
    /// Dispatch cycles between load samples (0 = never sample)
    pub load_sample_interval: u32,
    /// How long an idle loop waits on its doorbell before re-checking
    pub idle_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_quantum: BASE_QUANTUM,
            max_load: 4.0,
            load_sample_interval: 16,
            idle_wait: Duration::from_millis(1),
        }
    }
}

/// Interrupt dispatcher tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Idle wait between completion polls
    pub poll_interval: Duration,
    /// Core the worker thread is pinned to, if any
    pub core: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(500),
            core: None,
        }
    }
}

//! Time-slice controller
//!
//! Stretches every task's quantum with system load:
//! `quantum = base * (1 + load)`, with the load clamped to `[0, max_load]`.
//! Load is sampled every `load_sample_interval` dispatch cycles, not on
//! every dispatch.

use crate::config::SchedulerConfig;

/// External load source
pub trait LoadSensor {
    /// Current system load, expected in `[0, ∞)`
    fn sample(&mut self) -> f32;
}

/// Sensor that always reports the same load
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FixedLoad(pub f32);

impl LoadSensor for FixedLoad {
    fn sample(&mut self) -> f32 {
        self.0
    }
}

/// Quantum for `base` ticks at `load`
///
/// Negative or NaN load counts as zero and load above `max_load` is clamped.
/// Never returns less than one tick.
pub fn compute_quantum(base: u32, load: f32, max_load: f32) -> u32 {
    let load = clamp_load(load, max_load);
    let quantum = base as f32 * (1.0 + load);
    (quantum as u32).max(1)
}

fn clamp_load(load: f32, max_load: f32) -> f32 {
    if load.is_nan() || load <= 0.0 {
        0.0
    } else {
        load.min(max_load.max(0.0))
    }
}

/// Load sampling state
#[derive(Debug, Clone, Copy)]
pub struct QuantumController {
    max_load: f32,
    interval: u32,
    load: f32,
    samples: u64,
}

impl QuantumController {
    /// Controller starting at zero load
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_load: config.max_load,
            interval: config.load_sample_interval,
            load: 0.0,
            samples: 0,
        }
    }

    /// Is a sample due on dispatch cycle `cycle`?
    pub fn is_due(&self, cycle: u64) -> bool {
        self.interval != 0 && cycle % self.interval as u64 == 0
    }

    /// Read the sensor and keep the clamped value
    pub fn sample<S: LoadSensor + ?Sized>(&mut self, sensor: &mut S) -> f32 {
        self.load = clamp_load(sensor.sample(), self.max_load);
        self.samples += 1;
        self.load
    }

    /// Quantum for `base` at the last sampled load
    pub fn quantum_for(&self, base: u32) -> u32 {
        compute_quantum(base, self.load, self.max_load)
    }

    /// Last sampled (clamped) load
    pub fn load(&self) -> f32 {
        self.load
    }

    /// Samples taken so far
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

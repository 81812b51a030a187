//! EDF-RR RTOS: priority/EDF round-robin scheduling over lock-free interrupt rings
//!
//! Single-core cooperative scheduler core for deterministic task dispatch:
//! - Static task table addressed by generational handles (no heap after startup)
//! - Ready queue ordered by priority, then earliest deadline, then FIFO
//! - Load-scaled time slices charged in logical ticks
//! - Lock-free SPSC request/response rings between the scheduler and a
//!   kernel-side interrupt dispatcher running on its own thread
//! - Interrupt responses preempt ordinary dispatch
//!
//! The core is `no_std`; the `std` feature (default) adds the threaded
//! dispatcher worker and a blocking doorbell.
//!
//! ```no_run
//! use edfrr_rtos::{Channel, Priority, Scheduler, SchedulerConfig, Step, TaskContext, TaskSpec};
//!
//! let mut tick = |_cx: &mut TaskContext<'_>| Step::Yield;
//! let mut channel: Channel = Channel::new();
//! let (user, _kernel) = channel.split();
//! let mut scheduler = Scheduler::new(user, SchedulerConfig::default());
//! scheduler.create_task(TaskSpec::new("tick", Priority::NORMAL), &mut tick)?;
//! scheduler.start()?;
//! # Ok::<(), edfrr_rtos::Error>(())
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod irq;
pub mod kernel;
mod loom;
pub mod quantum;
pub mod ready;
pub mod ring;
pub mod scheduler;
mod table;
pub mod task;

pub use channel::{Channel, Doorbell, KernelEnd, RequestPort, StopHandle, UserEnd};
pub use clock::{Deadline, TickClock};
pub use config::{DispatcherConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use irq::{
    CompletionStatus, HandlerRef, InterruptClass, InterruptEvent, IoPayload, Request, RequestKind,
    Response, Seq,
};
pub use kernel::{AsyncIo, BindError, Completion, CoreBinder, Dispatcher, DispatcherStats, IoRequest, LoopbackIo, NoAffinity};
pub use quantum::{compute_quantum, FixedLoad, LoadSensor};
pub use ring::InterruptRing;
pub use scheduler::{Activation, Dispatch, Outcome, Scheduler, SchedulerState, SchedulerStats};
pub use task::{Priority, Runnable, Step, TaskContext, TaskHandle, TaskInfo, TaskSpec, TaskState};

//! Task definition: handles, descriptors and the runnable capability
//!
//! A task is a named unit of work with a priority, an optional period and
//! deadline, and a time-slice budget charged in logical ticks. Task bodies
//! implement [`Runnable`]; the scheduler calls them one tick at a time.

use core::fmt;

use crate::channel::{RequestPort, StopHandle};
use crate::clock::Deadline;
use crate::config::NAME_LEN;
use crate::error::Result;
use crate::irq::{HandlerRef, InterruptClass, InterruptEvent, IoPayload, RequestKind, Seq};

/// Fixed-capacity task name
pub type TaskName = heapless::String<NAME_LEN>;

/// Task priority (higher number = more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Background work
    pub const IDLE: Priority = Priority(0);
    /// Logging, telemetry
    pub const LOW: Priority = Priority(1);
    /// Ordinary tasks
    pub const NORMAL: Priority = Priority(2);
    /// Latency-sensitive tasks
    pub const HIGH: Priority = Priority(3);
    /// Interrupt bottom halves
    pub const CRITICAL: Priority = Priority(u8::MAX);
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the ready queue
    Ready,
    /// Current task of the scheduler
    Running,
    /// Waiting for an interrupt response
    Blocked,
    /// Taken out of dispatch until resumed
    Suspended,
}

/// Opaque handle to a task table slot
///
/// The generation changes every time a slot is reused, so a handle to a
/// deleted task never aliases its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    index: u16,
    generation: u16,
}

impl TaskHandle {
    pub(crate) const fn new(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    /// Table slot this handle points at
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u16 {
        self.generation
    }

    /// Pack into the 32-bit form carried by interrupt requests
    pub const fn to_raw(self) -> u32 {
        ((self.generation as u32) << 16) | self.index as u32
    }

    /// Unpack a handle carried by an interrupt response
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            index: raw as u16,
            generation: (raw >> 16) as u16,
        }
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

impl From<TaskHandle> for HandlerRef {
    fn from(handle: TaskHandle) -> Self {
        HandlerRef(handle.to_raw())
    }
}

impl From<HandlerRef> for TaskHandle {
    fn from(handler: HandlerRef) -> Self {
        TaskHandle::from_raw(handler.0)
    }
}

/// What a task wants after one tick of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep running while budget remains
    Continue,
    /// Give the CPU back; unused budget carries over
    Yield,
    /// Sleep until an interrupt response arrives for this task
    Block,
    /// This activation is finished
    Complete,
}

/// The capability a task (or interrupt handler) runs through
///
/// `run` is called once per tick of the task's quantum. It must return
/// promptly: a body that never returns can't be preempted by this core.
pub trait Runnable {
    /// Perform one tick of work
    fn run(&mut self, cx: &mut TaskContext<'_>) -> Step;
}

impl<F> Runnable for F
where
    F: FnMut(&mut TaskContext<'_>) -> Step,
{
    fn run(&mut self, cx: &mut TaskContext<'_>) -> Step {
        self(cx)
    }
}

/// Per-tick view handed to a [`Runnable`]
pub struct TaskContext<'r> {
    handle: TaskHandle,
    name: &'r str,
    arg: usize,
    now: u64,
    remaining: u32,
    interrupt: Option<InterruptEvent>,
    port: &'r mut dyn RequestPort,
    stop: StopHandle<'r>,
}

impl<'r> TaskContext<'r> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: TaskHandle,
        name: &'r str,
        arg: usize,
        now: u64,
        remaining: u32,
        interrupt: Option<InterruptEvent>,
        port: &'r mut dyn RequestPort,
        stop: StopHandle<'r>,
    ) -> Self {
        Self {
            handle,
            name,
            arg,
            now,
            remaining,
            interrupt,
            port,
            stop,
        }
    }

    /// Handle of the running task
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// Name of the running task
    pub fn name(&self) -> &str {
        self.name
    }

    /// Opaque argument given at creation
    pub fn arg(&self) -> usize {
        self.arg
    }

    /// Logical tick at which this tick of work started
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Budget left in the current quantum, including this tick
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Interrupt response being serviced
    ///
    /// Only set on the first tick of an interrupt-servicing activation.
    pub fn interrupt(&self) -> Option<&InterruptEvent> {
        self.interrupt.as_ref()
    }

    /// Queue an asynchronous I/O request for `class`
    pub fn submit_io(&mut self, class: InterruptClass, payload: IoPayload) -> Result<Seq> {
        self.port.submit(class, RequestKind::IoSubmit { payload })
    }

    /// Register the running task as the handler for `class`
    pub fn register_handler(&mut self, class: InterruptClass, ctx: u64) -> Result<Seq> {
        let handler = self.handle.into();
        self.port
            .submit(class, RequestKind::RegisterHandler { handler, ctx })
    }

    /// Ask both loops to stop after the current cycle
    pub fn request_stop(&self) {
        self.stop.stop();
    }
}

/// Creation parameters for a task
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec<'n> {
    pub(crate) name: &'n str,
    pub(crate) priority: Priority,
    pub(crate) period: Option<u64>,
    pub(crate) deadline: Option<u64>,
    pub(crate) arg: usize,
    pub(crate) quantum: Option<u32>,
}

impl<'n> TaskSpec<'n> {
    /// Aperiodic task with no deadline
    pub fn new(name: &'n str, priority: Priority) -> Self {
        Self {
            name,
            priority,
            period: None,
            deadline: None,
            arg: 0,
            quantum: None,
        }
    }

    /// Recurring task, re-released every `ticks`
    pub fn period(mut self, ticks: u64) -> Self {
        self.period = Some(ticks);
        self
    }

    /// Deadline relative to creation (and to each release for periodic tasks)
    pub fn deadline(mut self, ticks: u64) -> Self {
        self.deadline = Some(ticks);
        self
    }

    /// Opaque argument visible through [`TaskContext::arg`]
    pub fn arg(mut self, arg: usize) -> Self {
        self.arg = arg;
        self
    }

    /// Base quantum override (ticks at zero load)
    pub fn quantum(mut self, ticks: u32) -> Self {
        self.quantum = Some(ticks);
        self
    }
}

/// Task table entry
pub(crate) struct TaskRecord<'a> {
    pub(crate) name: TaskName,
    /// Taken out while the task runs
    pub(crate) runnable: Option<&'a mut dyn Runnable>,
    pub(crate) arg: usize,
    pub(crate) priority: Priority,
    pub(crate) period: Option<u64>,
    pub(crate) deadline: Option<Deadline>,
    pub(crate) base_quantum: u32,
    pub(crate) time_slice: u32,
    pub(crate) remaining: u32,
    pub(crate) state: TaskState,
    pub(crate) activations: u32,
    pub(crate) deadline_misses: u32,
    pub(crate) ticks: u64,
}

impl<'a> TaskRecord<'a> {
    pub(crate) fn new(
        spec: &TaskSpec<'_>,
        runnable: &'a mut dyn Runnable,
        now: u64,
        base_quantum: u32,
        time_slice: u32,
    ) -> Self {
        // Periodic tasks without an explicit deadline must finish by the next release
        let deadline = spec
            .deadline
            .or(spec.period)
            .map(|relative| Deadline::new(now, relative));

        Self {
            name: task_name(spec.name),
            runnable: Some(runnable),
            arg: spec.arg,
            priority: spec.priority,
            period: spec.period,
            deadline,
            base_quantum,
            time_slice,
            remaining: 0,
            state: TaskState::Ready,
            activations: 0,
            deadline_misses: 0,
            ticks: 0,
        }
    }

    /// Absolute deadline used for EDF ordering (`u64::MAX` = none)
    pub(crate) fn due(&self) -> u64 {
        self.deadline.map_or(u64::MAX, |d| d.due())
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            period: self.period,
            deadline: self.deadline.map(|d| d.due()),
            time_slice: self.time_slice,
            remaining: self.remaining,
            activations: self.activations,
            deadline_misses: self.deadline_misses,
            ticks: self.ticks,
        }
    }
}

/// Snapshot of a task's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task name
    pub name: TaskName,
    /// Priority
    pub priority: Priority,
    /// Current state
    pub state: TaskState,
    /// Period in ticks, for recurring tasks
    pub period: Option<u64>,
    /// Absolute deadline of the current activation
    pub deadline: Option<u64>,
    /// Full quantum in ticks
    pub time_slice: u32,
    /// Budget left in the current quantum
    pub remaining: u32,
    /// Completed activations
    pub activations: u32,
    /// Activations completed after their deadline
    pub deadline_misses: u32,
    /// Ticks charged in total
    pub ticks: u64,
}

/// Truncate to [`NAME_LEN`] bytes on a char boundary
pub(crate) fn task_name(name: &str) -> TaskName {
    let mut end = name.len().min(NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = TaskName::new();
    // Cannot fail: `end` <= NAME_LEN
    let _ = out.push_str(&name[..end]);
    out
}

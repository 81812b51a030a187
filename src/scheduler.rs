//! Priority / EDF round-robin scheduler
//!
//! Cooperative, single-threaded dispatch loop on the user side of the
//! channel. Each cycle:
//!
//! 1. re-queue the task that ran last cycle, if it is still runnable, so it
//!    competes with its equals (round-robin),
//! 2. drain the response ring; a serviceable response selects its handler
//!    task unconditionally,
//! 3. otherwise pop the ready queue head (highest priority, earliest
//!    deadline, FIFO),
//! 4. refill the quantum if it was used up, then call the task one tick at
//!    a time until it yields, blocks, completes, exhausts its quantum, or an
//!    interrupt response shows up.
//!
//! Quantum accounting is in logical ticks: one [`Runnable::run`] call is
//! one tick. A body that never returns is a configuration bug; nothing here
//! can take the CPU back from it.

use log::{debug, error, info, trace, warn};

use crate::channel::{RequestPort, StopHandle, UserEnd};
use crate::clock::TickClock;
use crate::config::{SchedulerConfig, PENDING_RESPONSES, RING_CAPACITY};
use crate::error::{Error, Result};
use crate::irq::{InterruptClass, InterruptEvent, IoPayload, RequestKind, Response, Seq};
use crate::quantum::{LoadSensor, QuantumController};
use crate::ready::{ReadyEntry, ReadyQueue};
use crate::table::TaskTable;
use crate::task::{
    task_name, Runnable, Step, TaskContext, TaskHandle, TaskInfo, TaskRecord, TaskSpec, TaskState,
};

/// Dispatch loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing to run this cycle
    Idle,
    /// Selecting the next task
    Dispatching,
    /// A task holds the CPU
    Running,
    /// Quantum exhausted or interrupt pending; the task goes back to the queue
    Preempting,
    /// Stop observed, or halted on a corrupted registry
    Stopped,
}

/// How an activation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Quantum used up
    Exhausted,
    /// Task yielded voluntarily
    Yielded,
    /// An interrupt response became available
    Preempted,
    /// Task is waiting for an interrupt response
    Blocked,
    /// Activation finished (periodic tasks are re-released, others retired)
    Completed,
}

/// One task activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// Task that ran
    pub task: TaskHandle,
    /// Ticks charged
    pub ticks: u32,
    /// How it ended
    pub outcome: Outcome,
    /// Was this an interrupt-servicing activation?
    pub interrupt: bool,
}

/// Result of one dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing was runnable
    Idle,
    /// A task ran
    Ran(Activation),
    /// The stop flag is raised
    Stopped,
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Dispatch cycles started
    pub cycles: u64,
    /// Activations run
    pub dispatches: u64,
    /// Cycles with nothing to run
    pub idle_cycles: u64,
    /// Activations of a different task than the previous one
    pub context_switches: u64,
    /// Interrupt-servicing activations
    pub interrupts_serviced: u64,
    /// Responses dropped because their handler no longer exists
    pub stale_responses: u64,
    /// Responses for suspended handlers dropped to make room for newer ones
    pub dropped_responses: u64,
    /// Activations completed after their deadline
    pub deadline_misses: u64,
    /// Load sensor samples
    pub load_samples: u64,
}

/// Priority/EDF round-robin scheduler
///
/// Owns every task record; callers only hold [`TaskHandle`]s.
pub struct Scheduler<'a, const N: usize = RING_CAPACITY> {
    config: SchedulerConfig,
    table: TaskTable<'a>,
    ready: ReadyQueue,
    /// Task that ran last cycle and is still runnable
    current: Option<TaskHandle>,
    last_run: Option<TaskHandle>,
    state: SchedulerState,
    user: UserEnd<'a, N>,
    /// Drained responses not yet serviced
    pending: heapless::Vec<Response, PENDING_RESPONSES>,
    /// Responses held for suspended handlers, oldest first
    parked: heapless::Vec<Response, PENDING_RESPONSES>,
    quantum: QuantumController,
    sensor: Option<&'a mut dyn LoadSensor>,
    clock: TickClock,
    stats: SchedulerStats,
    /// Set once the registry is found corrupted; the loop stays halted
    fault: Option<Error>,
}

impl<'a, const N: usize> Scheduler<'a, N> {
    /// Scheduler on the user end of a channel
    pub fn new(user: UserEnd<'a, N>, config: SchedulerConfig) -> Self {
        Self {
            quantum: QuantumController::new(&config),
            config,
            table: TaskTable::new(),
            ready: ReadyQueue::new(),
            current: None,
            last_run: None,
            state: SchedulerState::Idle,
            user,
            pending: heapless::Vec::new(),
            parked: heapless::Vec::new(),
            sensor: None,
            clock: TickClock::new(),
            stats: SchedulerStats::default(),
            fault: None,
        }
    }

    /// Attach the load sensor the time-slice controller samples
    pub fn with_load_sensor(mut self, sensor: &'a mut dyn LoadSensor) -> Self {
        self.sensor = Some(sensor);
        self
    }

    /// Register a task; it starts Ready
    pub fn create_task(
        &mut self,
        spec: TaskSpec<'_>,
        runnable: &'a mut dyn Runnable,
    ) -> Result<TaskHandle> {
        if self.table.is_full() {
            warn!("task table full, cannot create '{}'", spec.name);
            return Err(Error::ResourceExhausted);
        }
        let name = task_name(spec.name);
        if self.table.contains_name(&name) {
            return Err(Error::DuplicateName);
        }

        let base = spec.quantum.unwrap_or(self.config.base_quantum);
        let time_slice = self.quantum.quantum_for(base);
        let record = TaskRecord::new(&spec, runnable, self.clock.now(), base, time_slice);
        let (priority, due) = (record.priority, record.due());
        let handle = self.table.insert(record).ok_or(Error::ResourceExhausted)?;

        let entry = ReadyEntry {
            handle,
            priority,
            due,
        };
        if self.ready.insert(entry).is_err() {
            self.table.remove(handle);
            return Err(Error::ResourceExhausted);
        }

        info!(
            "task '{}' created as {} (priority {}, quantum {})",
            name, handle, priority.0, time_slice
        );
        Ok(handle)
    }

    /// Remove a task from whichever queue holds it and free its slot
    ///
    /// Unknown or already-deleted handles are ignored. Returns whether a
    /// task was removed. Must only be called from the scheduler's thread.
    pub fn delete_task(&mut self, handle: TaskHandle) -> bool {
        let Some(record) = self.table.remove(handle) else {
            debug!("delete of unknown task {} ignored", handle);
            return false;
        };
        self.ready.remove(handle);
        if self.current == Some(handle) {
            self.current = None;
        }
        info!("task '{}' ({}) deleted", record.name, handle);
        true
    }

    /// Take a task out of dispatch until [`Scheduler::resume`]
    pub fn suspend(&mut self, handle: TaskHandle) -> Result<()> {
        let record = self
            .table
            .get_mut(handle)
            .ok_or(Error::InvalidHandle(handle))?;
        record.state = TaskState::Suspended;
        self.ready.remove(handle);
        if self.current == Some(handle) {
            self.current = None;
        }

        let mut i = 0;
        while i < self.pending.len() {
            if TaskHandle::from(self.pending[i].handler) == handle {
                if let Some(response) = remove_at(&mut self.pending, i) {
                    park(&mut self.parked, response, &mut self.stats);
                }
            } else {
                i += 1;
            }
        }
        trace!("task {} suspended", handle);
        Ok(())
    }

    /// Put a suspended task back in the ready queue
    pub fn resume(&mut self, handle: TaskHandle) -> Result<()> {
        let record = self
            .table
            .get_mut(handle)
            .ok_or(Error::InvalidHandle(handle))?;
        if record.state != TaskState::Suspended {
            return Ok(());
        }
        record.state = TaskState::Ready;
        let entry = ReadyEntry {
            handle,
            priority: record.priority,
            due: record.due(),
        };
        self.ready
            .insert(entry)
            .map_err(|_| Error::ResourceExhausted)?;
        trace!("task {} resumed", handle);
        Ok(())
    }

    /// Ask the kernel side to route responses of `class` to `handler`
    ///
    /// `ctx` comes back with every response of the class.
    pub fn register_handler(
        &mut self,
        class: InterruptClass,
        handler: TaskHandle,
        ctx: u64,
    ) -> Result<Seq> {
        if self.table.get(handler).is_none() {
            return Err(Error::InvalidHandle(handler));
        }
        let kind = RequestKind::RegisterHandler {
            handler: handler.into(),
            ctx,
        };
        let seq = self.user.submit(class, kind)?;
        info!("task {} registered for interrupt class {}", handler, class.0);
        Ok(seq)
    }

    /// Publish a request on the request ring
    pub fn submit_request(&mut self, class: InterruptClass, kind: RequestKind) -> Result<Seq> {
        self.user.submit(class, kind)
    }

    /// Publish an I/O request on the request ring
    pub fn submit_io(&mut self, class: InterruptClass, payload: IoPayload) -> Result<Seq> {
        self.user.submit(class, RequestKind::IoSubmit { payload })
    }

    /// Snapshot of a live task
    pub fn task(&self, handle: TaskHandle) -> Result<TaskInfo> {
        self.table
            .get(handle)
            .map(TaskRecord::info)
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Run dispatch cycles until a stop is requested
    ///
    /// Blocks on the user doorbell while there is nothing to run. Returns
    /// an error only for a corrupted registry ([`Error::InvalidTask`]).
    pub fn start(&mut self) -> Result<()> {
        info!("scheduler started with {} tasks", self.table.len());
        loop {
            match self.dispatch_once()? {
                Dispatch::Stopped => break,
                Dispatch::Idle => {
                    self.user.wait(self.config.idle_wait);
                }
                Dispatch::Ran(_) => {}
            }
        }
        info!(
            "scheduler stopped after {} cycles ({} dispatches)",
            self.stats.cycles, self.stats.dispatches
        );
        Ok(())
    }

    /// Request a stop; observed between dispatch cycles
    pub fn stop(&self) {
        self.user.stop_handle().stop();
    }

    /// Stop handle usable from other threads
    pub fn stop_handle(&self) -> StopHandle<'a> {
        self.user.stop_handle()
    }

    /// Run a single dispatch cycle
    ///
    /// After an [`Error::InvalidTask`] every further call returns the same
    /// error.
    pub fn dispatch_once(&mut self) -> Result<Dispatch> {
        if let Some(err) = self.fault {
            return Err(err);
        }
        let result = self.cycle();
        if let Err(err) = result {
            error!("scheduler halted: {}", err);
            self.state = SchedulerState::Stopped;
            self.fault = Some(err);
        }
        result
    }

    fn cycle(&mut self) -> Result<Dispatch> {
        if self.user.stop_requested() {
            self.state = SchedulerState::Stopped;
            return Ok(Dispatch::Stopped);
        }
        self.state = SchedulerState::Dispatching;
        self.stats.cycles += 1;

        self.sample_load();
        self.requeue_current()?;
        self.collect_responses();

        let (handle, event) = match self.next_interrupt() {
            Some((handle, response)) => {
                self.ready.remove(handle);
                (handle, Some(InterruptEvent::from(&response)))
            }
            None => match self.ready.remove_head() {
                Some(entry) => (entry.handle, None),
                None => {
                    self.stats.idle_cycles += 1;
                    self.state = SchedulerState::Idle;
                    return Ok(Dispatch::Idle);
                }
            },
        };

        self.run_activation(handle, event).map(Dispatch::Ran)
    }

    /// Put last cycle's task back in the queue before selecting
    fn requeue_current(&mut self) -> Result<()> {
        let Some(handle) = self.current.take() else {
            return Ok(());
        };
        let corrupt = Error::InvalidTask {
            slot: handle.index(),
        };
        let record = self.table.get_mut(handle).ok_or(corrupt)?;
        record.state = TaskState::Ready;
        let entry = ReadyEntry {
            handle,
            priority: record.priority,
            due: record.due(),
        };
        // A task linked into the queue twice means the bookkeeping is broken
        self.ready.insert(entry).map_err(|_| corrupt)
    }

    /// Move responses off the ring while `pending` has room
    ///
    /// Responses for suspended handlers are parked instead, so they never
    /// keep the ring from reaching a live handler.
    fn collect_responses(&mut self) {
        let Self {
            user,
            table,
            pending,
            parked,
            stats,
            ..
        } = self;

        let mut batch = user.drain_responses();
        while !pending.is_full() {
            let Some(response) = batch.next() else {
                break;
            };
            let suspended = table
                .get(TaskHandle::from(response.handler))
                .is_some_and(|record| record.state == TaskState::Suspended);
            if suspended {
                park(parked, response, stats);
            } else {
                // Cannot fail: the loop only runs while `pending` has room
                let _ = pending.push(response);
            }
        }
    }

    /// Oldest response whose handler can run now; parked ones go first
    fn next_interrupt(&mut self) -> Option<(TaskHandle, Response)> {
        let Self {
            table,
            pending,
            parked,
            stats,
            ..
        } = self;
        if let Some(found) = take_serviceable(parked, table, stats) {
            return Some(found);
        }
        take_serviceable(pending, table, stats)
    }

    /// Is there a response some handler could take right now?
    fn interrupt_pending(&mut self) -> bool {
        self.collect_responses();
        let table = &self.table;
        self.parked.iter().chain(self.pending.iter()).any(|response| {
            table
                .get(TaskHandle::from(response.handler))
                .is_some_and(|record| record.state != TaskState::Suspended)
        })
    }

    fn run_activation(
        &mut self,
        handle: TaskHandle,
        mut event: Option<InterruptEvent>,
    ) -> Result<Activation> {
        let corrupt = Error::InvalidTask {
            slot: handle.index(),
        };
        let record = self.table.get_mut(handle).ok_or(corrupt)?;
        let runnable = record.runnable.take().ok_or(corrupt)?;
        if record.remaining == 0 {
            record.remaining = record.time_slice;
        }
        record.state = TaskState::Running;
        let name = record.name.clone();
        let arg = record.arg;
        let mut remaining = record.remaining;

        let interrupt = event.is_some();
        self.stats.dispatches += 1;
        if interrupt {
            self.stats.interrupts_serviced += 1;
        }
        if self.last_run != Some(handle) {
            self.stats.context_switches += 1;
            self.last_run = Some(handle);
        }
        self.state = SchedulerState::Running;
        trace!(
            "dispatch '{}' ({}) with {} ticks{}",
            name,
            handle,
            remaining,
            if interrupt { ", servicing interrupt" } else { "" }
        );

        let stop = self.user.stop_handle();
        let mut ticks = 0u32;
        let outcome = loop {
            if remaining == 0 {
                break Outcome::Exhausted;
            }
            let mut cx = TaskContext::new(
                handle,
                &name,
                arg,
                self.clock.now(),
                remaining,
                event.take(),
                &mut self.user,
                stop,
            );
            let step = runnable.run(&mut cx);
            self.clock.advance(1);
            ticks += 1;
            remaining -= 1;

            match step {
                Step::Continue => {
                    if self.interrupt_pending() {
                        break Outcome::Preempted;
                    }
                }
                Step::Yield => break Outcome::Yielded,
                Step::Block => break Outcome::Blocked,
                Step::Complete => break Outcome::Completed,
            }
        };

        let now = self.clock.now();
        let record = self.table.get_mut(handle).ok_or(corrupt)?;
        record.runnable = Some(runnable);
        record.remaining = remaining;
        record.ticks += ticks as u64;

        match outcome {
            Outcome::Exhausted | Outcome::Preempted => {
                self.current = Some(handle);
                self.state = SchedulerState::Preempting;
            }
            Outcome::Yielded => {
                self.current = Some(handle);
                self.state = SchedulerState::Dispatching;
            }
            Outcome::Blocked => {
                record.state = TaskState::Blocked;
                self.state = SchedulerState::Dispatching;
                trace!("task {} blocked", handle);
            }
            Outcome::Completed => {
                record.activations += 1;
                if let Some(deadline) = record.deadline {
                    if !deadline.is_met(now) {
                        record.deadline_misses += 1;
                        self.stats.deadline_misses += 1;
                        warn!(
                            "task '{}' missed its deadline (due {}, finished {})",
                            name,
                            deadline.due(),
                            now
                        );
                    }
                }
                match record.period {
                    Some(period) => {
                        if let Some(deadline) = record.deadline.as_mut() {
                            deadline.next_period(period);
                        }
                        record.remaining = 0;
                        self.current = Some(handle);
                    }
                    None => {
                        self.table.remove(handle);
                        if self.last_run == Some(handle) {
                            self.last_run = None;
                        }
                        info!("task '{}' ({}) finished", name, handle);
                    }
                }
                self.state = SchedulerState::Dispatching;
            }
        }

        Ok(Activation {
            task: handle,
            ticks,
            outcome,
            interrupt,
        })
    }

    /// Resize every quantum when a load sample is due
    fn sample_load(&mut self) {
        if !self.quantum.is_due(self.stats.cycles) {
            return;
        }
        let Some(sensor) = self.sensor.as_deref_mut() else {
            return;
        };
        let load = self.quantum.sample(sensor);
        self.stats.load_samples += 1;
        for record in self.table.records_mut() {
            record.time_slice = self.quantum.quantum_for(record.base_quantum);
        }
        debug!("load sampled at {:.2}, quanta resized", load);
    }

    /// Current loop state
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Task that ran last cycle and will be re-queued next cycle
    pub fn current(&self) -> Option<TaskHandle> {
        self.current
    }

    /// Tasks waiting in the ready queue
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Live tasks
    pub fn task_count(&self) -> usize {
        self.table.len()
    }

    /// Logical time in ticks
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Last sampled system load
    pub fn load(&self) -> f32 {
        self.quantum.load()
    }

    /// Counters
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}

/// Remove and return the first response in `buf` whose handler is live and
/// not suspended, dropping stale ones on the way
fn take_serviceable<const C: usize>(
    buf: &mut heapless::Vec<Response, C>,
    table: &TaskTable<'_>,
    stats: &mut SchedulerStats,
) -> Option<(TaskHandle, Response)> {
    let mut i = 0;
    while i < buf.len() {
        let response = buf[i];
        let handle = TaskHandle::from(response.handler);
        match table.get(handle).map(|record| record.state) {
            None => {
                warn!(
                    "dropping response {} of class {}: handler {} no longer exists",
                    response.seq.0, response.class.0, handle
                );
                stats.stale_responses += 1;
                remove_at(buf, i);
            }
            Some(TaskState::Suspended) => i += 1,
            Some(_) => {
                remove_at(buf, i);
                return Some((handle, response));
            }
        }
    }
    None
}

/// Hold a response for a suspended handler, evicting the oldest when full
fn park<const C: usize>(
    parked: &mut heapless::Vec<Response, C>,
    response: Response,
    stats: &mut SchedulerStats,
) {
    if parked.is_full() {
        if let Some(oldest) = remove_at(parked, 0) {
            warn!(
                "parked responses full, dropping response {} of class {}",
                oldest.seq.0, oldest.class.0
            );
            stats.dropped_responses += 1;
        }
    }
    // Cannot fail: a slot was freed above
    let _ = parked.push(response);
}

fn remove_at<T, const C: usize>(items: &mut heapless::Vec<T, C>, index: usize) -> Option<T> {
    if index >= items.len() {
        return None;
    }
    items[index..].rotate_left(1);
    items.pop()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::channel::{Channel, KernelEnd};
    use crate::config::{MAX_TASKS, PENDING_RESPONSES};
    use crate::irq::{CompletionStatus, HandlerRef};
    use crate::quantum::FixedLoad;
    use crate::task::Priority;
    use core::cell::RefCell;

    /// Records every tick; replays `steps`, repeating the last one
    struct Recorder<'t> {
        label: &'static str,
        steps: &'static [Step],
        at: usize,
        trace: &'t RefCell<Vec<&'static str>>,
        events: Vec<InterruptEvent>,
    }

    impl<'t> Recorder<'t> {
        fn new(
            label: &'static str,
            steps: &'static [Step],
            trace: &'t RefCell<Vec<&'static str>>,
        ) -> Self {
            Self {
                label,
                steps,
                at: 0,
                trace,
                events: Vec::new(),
            }
        }
    }

    impl Runnable for Recorder<'_> {
        fn run(&mut self, cx: &mut TaskContext<'_>) -> Step {
            self.trace.borrow_mut().push(self.label);
            if let Some(event) = cx.interrupt() {
                self.events.push(*event);
            }
            let step = self.steps[self.at.min(self.steps.len() - 1)];
            self.at += 1;
            step
        }
    }

    fn ran(dispatch: Dispatch) -> Activation {
        match dispatch {
            Dispatch::Ran(activation) => activation,
            other => panic!("expected an activation, got {:?}", other),
        }
    }

    fn response_for(handler: TaskHandle, seq: u32, status: CompletionStatus) -> Response {
        Response {
            seq: Seq(seq),
            class: InterruptClass(7),
            status,
            handler: handler.into(),
            ctx: 0xC0FFEE,
        }
    }

    #[test]
    fn test_dispatch_order_by_priority() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Complete], &trace);
        let mut b = Recorder::new("B", &[Step::Complete], &trace);
        let mut c = Recorder::new("C", &[Step::Complete], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        sched.create_task(TaskSpec::new("A", Priority(3)), &mut a).unwrap();
        sched.create_task(TaskSpec::new("B", Priority(1)), &mut b).unwrap();
        sched.create_task(TaskSpec::new("C", Priority(2)), &mut c).unwrap();

        for _ in 0..3 {
            ran(sched.dispatch_once().unwrap());
        }
        assert_eq!(*trace.borrow(), vec!["A", "C", "B"]);
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Idle);
        assert_eq!(sched.state(), SchedulerState::Idle);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn test_round_robin_equal_priority() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Yield], &trace);
        let mut b = Recorder::new("B", &[Step::Yield], &trace);
        let mut c = Recorder::new("C", &[Step::Yield], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        for (name, body) in [("A", &mut a), ("B", &mut b), ("C", &mut c)] {
            sched.create_task(TaskSpec::new(name, Priority::NORMAL), body).unwrap();
        }
        for _ in 0..7 {
            let activation = ran(sched.dispatch_once().unwrap());
            assert_eq!(activation.outcome, Outcome::Yielded);
        }
        assert_eq!(*trace.borrow(), vec!["A", "B", "C", "A", "B", "C", "A"]);
    }

    #[test]
    fn test_higher_priority_keeps_cpu_after_yield() {
        let trace = RefCell::new(Vec::new());
        let mut hi = Recorder::new("hi", &[Step::Yield, Step::Yield, Step::Complete], &trace);
        let mut lo = Recorder::new("lo", &[Step::Complete], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        sched.create_task(TaskSpec::new("lo", Priority::LOW), &mut lo).unwrap();
        sched.create_task(TaskSpec::new("hi", Priority::HIGH), &mut hi).unwrap();
        for _ in 0..4 {
            ran(sched.dispatch_once().unwrap());
        }
        assert_eq!(*trace.borrow(), vec!["hi", "hi", "hi", "lo"]);
    }

    #[test]
    fn test_quantum_exhaustion_rotates() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Continue], &trace);
        let mut b = Recorder::new("B", &[Step::Continue], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        let ha = sched
            .create_task(TaskSpec::new("A", Priority::NORMAL).quantum(3), &mut a)
            .unwrap();
        sched
            .create_task(TaskSpec::new("B", Priority::NORMAL).quantum(2), &mut b)
            .unwrap();

        let first = ran(sched.dispatch_once().unwrap());
        assert_eq!(first.task, ha);
        assert_eq!(first.ticks, 3);
        assert_eq!(first.outcome, Outcome::Exhausted);
        assert_eq!(sched.state(), SchedulerState::Preempting);
        assert_eq!(sched.current(), Some(ha));

        let second = ran(sched.dispatch_once().unwrap());
        assert_eq!(second.ticks, 2);

        // A's quantum is refilled on its next turn
        let third = ran(sched.dispatch_once().unwrap());
        assert_eq!(third.task, ha);
        assert_eq!(third.ticks, 3);
        assert_eq!(*trace.borrow(), vec!["A", "A", "A", "B", "B", "A", "A", "A"]);
        assert_eq!(sched.now(), 8);
    }

    #[test]
    fn test_yield_carries_remaining_budget() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new(
            "A",
            &[Step::Continue, Step::Yield, Step::Continue],
            &trace,
        );
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let handle = sched
            .create_task(TaskSpec::new("A", Priority::NORMAL).quantum(5), &mut a)
            .unwrap();

        let first = ran(sched.dispatch_once().unwrap());
        assert_eq!((first.ticks, first.outcome), (2, Outcome::Yielded));
        assert_eq!(sched.task(handle).unwrap().remaining, 3);

        let second = ran(sched.dispatch_once().unwrap());
        assert_eq!((second.ticks, second.outcome), (3, Outcome::Exhausted));
        assert_eq!(sched.task(handle).unwrap().remaining, 0);
    }

    #[test]
    fn test_edf_within_priority() {
        let trace = RefCell::new(Vec::new());
        let mut late = Recorder::new("late", &[Step::Complete], &trace);
        let mut early = Recorder::new("early", &[Step::Complete], &trace);
        let mut none = Recorder::new("none", &[Step::Complete], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        sched.create_task(TaskSpec::new("none", Priority::NORMAL), &mut none).unwrap();
        sched
            .create_task(TaskSpec::new("late", Priority::NORMAL).deadline(50), &mut late)
            .unwrap();
        sched
            .create_task(TaskSpec::new("early", Priority::NORMAL).deadline(10), &mut early)
            .unwrap();
        for _ in 0..3 {
            ran(sched.dispatch_once().unwrap());
        }
        assert_eq!(*trace.borrow(), vec!["early", "late", "none"]);
    }

    #[test]
    fn test_interrupt_preempts_priority() {
        let trace = RefCell::new(Vec::new());
        let mut worker = Recorder::new("worker", &[Step::Yield], &trace);
        let mut handler = Recorder::new("handler", &[Step::Block], &trace);
        let mut channel = Channel::<8>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        sched
            .create_task(TaskSpec::new("worker", Priority::HIGH), &mut worker)
            .unwrap();
        let h = sched
            .create_task(TaskSpec::new("handler", Priority::LOW), &mut handler)
            .unwrap();

        assert!(kernel.post(response_for(h, 1, CompletionStatus::Completed(99))));
        let first = ran(sched.dispatch_once().unwrap());
        assert_eq!(first.task, h);
        assert!(first.interrupt);
        assert_eq!(first.outcome, Outcome::Blocked);
        assert_eq!(sched.task(h).unwrap().state, TaskState::Blocked);

        let second = ran(sched.dispatch_once().unwrap());
        assert!(!second.interrupt);
        assert_eq!(*trace.borrow(), vec!["handler", "worker"]);
        drop(sched);

        assert_eq!(handler.events.len(), 1);
        assert_eq!(handler.events[0].status, CompletionStatus::Completed(99));
        assert_eq!(handler.events[0].ctx, 0xC0FFEE);
    }

    /// Posts a response for `target` on its second tick
    struct Interrupter<'t, 'c> {
        kernel: &'t RefCell<KernelEnd<'c, 8>>,
        target: &'t core::cell::Cell<Option<TaskHandle>>,
        ticks: u32,
    }

    impl Runnable for Interrupter<'_, '_> {
        fn run(&mut self, _cx: &mut TaskContext<'_>) -> Step {
            self.ticks += 1;
            if self.ticks == 2 {
                let handler = self.target.get().unwrap();
                assert!(self
                    .kernel
                    .borrow_mut()
                    .post(response_for(handler, 5, CompletionStatus::Failed(3))));
            }
            Step::Continue
        }
    }

    #[test]
    fn test_interrupt_preempts_mid_quantum() {
        let trace = RefCell::new(Vec::new());
        let target = core::cell::Cell::new(None);
        let mut handler = Recorder::new("handler", &[Step::Block], &trace);
        let mut channel = Channel::<8>::new();
        let (user, kernel) = channel.split();
        let kernel = RefCell::new(kernel);
        let mut worker = Interrupter {
            kernel: &kernel,
            target: &target,
            ticks: 0,
        };
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        let w = sched
            .create_task(TaskSpec::new("worker", Priority::HIGH).quantum(10), &mut worker)
            .unwrap();
        let h = sched
            .create_task(TaskSpec::new("handler", Priority::LOW), &mut handler)
            .unwrap();
        target.set(Some(h));

        let run = ran(sched.dispatch_once().unwrap());
        assert_eq!((run.task, run.ticks, run.outcome), (w, 2, Outcome::Preempted));

        let serviced = ran(sched.dispatch_once().unwrap());
        assert_eq!(serviced.task, h);
        assert!(serviced.interrupt);

        // Worker resumes with its leftover budget
        let resumed = ran(sched.dispatch_once().unwrap());
        assert_eq!((resumed.task, resumed.ticks), (w, 8));
        drop(sched);
        assert_eq!(handler.events.len(), 1);
        assert_eq!(handler.events[0].status, CompletionStatus::Failed(3));
    }

    #[test]
    fn test_handler_invoked_exactly_once() {
        let trace = RefCell::new(Vec::new());
        let mut handler = Recorder::new("handler", &[Step::Block], &trace);
        let mut idle = Recorder::new("idle", &[Step::Yield], &trace);
        let mut channel = Channel::<8>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let h = sched
            .create_task(TaskSpec::new("handler", Priority::NORMAL), &mut handler)
            .unwrap();
        sched.create_task(TaskSpec::new("idle", Priority::IDLE), &mut idle).unwrap();

        kernel.post(response_for(h, 11, CompletionStatus::Completed(4)));
        for _ in 0..6 {
            sched.dispatch_once().unwrap();
        }
        assert_eq!(sched.stats().interrupts_serviced, 1);
        drop(sched);
        assert_eq!(handler.events.len(), 1);
        assert_eq!(handler.events[0].seq, Seq(11));
        assert_eq!(handler.events[0].status, CompletionStatus::Completed(4));
    }

    #[test]
    fn test_stale_response_dropped() {
        let trace = RefCell::new(Vec::new());
        let mut gone = Recorder::new("gone", &[Step::Block], &trace);
        let mut channel = Channel::<8>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let h = sched
            .create_task(TaskSpec::new("gone", Priority::NORMAL), &mut gone)
            .unwrap();
        assert!(sched.delete_task(h));

        kernel.post(response_for(h, 1, CompletionStatus::Completed(0)));
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Idle);
        assert_eq!(sched.stats().stale_responses, 1);
    }

    #[test]
    fn test_suspended_handler_keeps_response() {
        let trace = RefCell::new(Vec::new());
        let mut handler = Recorder::new("handler", &[Step::Block], &trace);
        let mut channel = Channel::<8>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let h = sched
            .create_task(TaskSpec::new("handler", Priority::NORMAL), &mut handler)
            .unwrap();
        sched.suspend(h).unwrap();

        kernel.post(response_for(h, 2, CompletionStatus::Completed(1)));
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Idle);
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Idle);

        sched.resume(h).unwrap();
        let serviced = ran(sched.dispatch_once().unwrap());
        assert!(serviced.interrupt);
        assert_eq!(serviced.task, h);
    }

    #[test]
    fn test_suspended_backlog_does_not_starve_live_handler() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("a", &[Step::Block], &trace);
        let mut b = Recorder::new("b", &[Step::Block], &trace);
        let mut channel = Channel::<32>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let ha = sched.create_task(TaskSpec::new("a", Priority::NORMAL), &mut a).unwrap();
        let hb = sched.create_task(TaskSpec::new("b", Priority::NORMAL), &mut b).unwrap();
        sched.suspend(ha).unwrap();

        for seq in 0..PENDING_RESPONSES as u32 {
            assert!(kernel.post(response_for(ha, seq, CompletionStatus::Completed(seq as u64))));
        }
        assert!(kernel.post(response_for(hb, 100, CompletionStatus::Completed(100))));

        let first = ran(sched.dispatch_once().unwrap());
        assert_eq!(first.task, hb);
        assert!(first.interrupt);

        sched.resume(ha).unwrap();
        for _ in 0..PENDING_RESPONSES {
            let serviced = ran(sched.dispatch_once().unwrap());
            assert_eq!(serviced.task, ha);
            assert!(serviced.interrupt);
        }
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Idle);
        assert_eq!(sched.stats().interrupts_serviced, PENDING_RESPONSES as u64 + 1);
        assert_eq!(sched.stats().dropped_responses, 0);
        drop(sched);

        let seqs: Vec<Seq> = a.events.iter().map(|event| event.seq).collect();
        let expected: Vec<Seq> = (0..PENDING_RESPONSES as u32).map(Seq).collect();
        assert_eq!(seqs, expected);
        assert_eq!(b.events.len(), 1);
        assert_eq!(b.events[0].seq, Seq(100));
    }

    #[test]
    fn test_parked_responses_drop_oldest_when_full() {
        let trace = RefCell::new(Vec::new());
        let mut handler = Recorder::new("handler", &[Step::Block], &trace);
        let mut channel = Channel::<32>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let h = sched
            .create_task(TaskSpec::new("handler", Priority::NORMAL), &mut handler)
            .unwrap();
        sched.suspend(h).unwrap();

        for seq in 0..=PENDING_RESPONSES as u32 {
            assert!(kernel.post(response_for(h, seq, CompletionStatus::Completed(0))));
        }
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Idle);
        assert_eq!(sched.stats().dropped_responses, 1);

        sched.resume(h).unwrap();
        for _ in 0..PENDING_RESPONSES {
            assert!(ran(sched.dispatch_once().unwrap()).interrupt);
        }
        drop(sched);

        let seqs: Vec<Seq> = handler.events.iter().map(|event| event.seq).collect();
        let expected: Vec<Seq> = (1..=PENDING_RESPONSES as u32).map(Seq).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn test_responses_for_suspended_handler_do_not_preempt() {
        let trace = RefCell::new(Vec::new());
        let mut worker = Recorder::new("worker", &[Step::Continue], &trace);
        let mut handler = Recorder::new("handler", &[Step::Block], &trace);
        let mut channel = Channel::<32>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let w = sched
            .create_task(TaskSpec::new("worker", Priority::HIGH).quantum(10), &mut worker)
            .unwrap();
        let h = sched
            .create_task(TaskSpec::new("handler", Priority::LOW), &mut handler)
            .unwrap();
        sched.suspend(h).unwrap();

        for seq in 0..10 {
            assert!(kernel.post(response_for(h, seq, CompletionStatus::Completed(0))));
        }
        for _ in 0..3 {
            let run = ran(sched.dispatch_once().unwrap());
            assert_eq!((run.task, run.ticks, run.outcome), (w, 10, Outcome::Exhausted));
            assert!(!run.interrupt);
        }
    }

    #[test]
    fn test_suspend_moves_pending_response_aside() {
        let trace = RefCell::new(Vec::new());
        let mut worker = Recorder::new("worker", &[Step::Continue], &trace);
        let mut handler = Recorder::new("handler", &[Step::Block], &trace);
        let mut channel = Channel::<8>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let w = sched
            .create_task(TaskSpec::new("worker", Priority::HIGH).quantum(4), &mut worker)
            .unwrap();
        let h = sched
            .create_task(TaskSpec::new("handler", Priority::LOW), &mut handler)
            .unwrap();

        // Drained while the handler is live, then the handler is suspended
        assert!(kernel.post(response_for(h, 3, CompletionStatus::Completed(0))));
        sched.collect_responses();
        sched.suspend(h).unwrap();

        let run = ran(sched.dispatch_once().unwrap());
        assert_eq!((run.task, run.ticks, run.outcome), (w, 4, Outcome::Exhausted));

        sched.resume(h).unwrap();
        let serviced = ran(sched.dispatch_once().unwrap());
        assert_eq!(serviced.task, h);
        assert!(serviced.interrupt);
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Yield], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        assert!(!sched.delete_task(TaskHandle::from_raw(0x0005_0003)));
        let handle = sched.create_task(TaskSpec::new("A", Priority::LOW), &mut a).unwrap();
        assert!(sched.delete_task(handle));
        assert!(!sched.delete_task(handle));
        assert_eq!(sched.task(handle), Err(Error::InvalidHandle(handle)));
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Idle);
    }

    #[test]
    fn test_delete_current_task() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Yield], &trace);
        let mut b = Recorder::new("B", &[Step::Yield], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let ha = sched.create_task(TaskSpec::new("A", Priority::HIGH), &mut a).unwrap();
        let hb = sched.create_task(TaskSpec::new("B", Priority::LOW), &mut b).unwrap();

        ran(sched.dispatch_once().unwrap());
        assert_eq!(sched.current(), Some(ha));
        assert!(sched.delete_task(ha));
        assert_eq!(sched.current(), None);
        assert_eq!(sched.ready_len(), 1);

        let next = ran(sched.dispatch_once().unwrap());
        assert_eq!(next.task, hb);
    }

    #[test]
    fn test_operations_on_dead_handle() {
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched: Scheduler<'_, 8> = Scheduler::new(user, SchedulerConfig::default());
        let dead = TaskHandle::from_raw(1);
        assert_eq!(sched.suspend(dead), Err(Error::InvalidHandle(dead)));
        assert_eq!(sched.resume(dead), Err(Error::InvalidHandle(dead)));
        assert_eq!(
            sched.register_handler(InterruptClass(1), dead, 0),
            Err(Error::InvalidHandle(dead))
        );
    }

    #[test]
    fn test_task_table_full() {
        let trace = RefCell::new(Vec::new());
        let names: Vec<String> = (0..=MAX_TASKS).map(|i| format!("t{}", i)).collect();
        let mut bodies: Vec<Recorder<'_>> = (0..=MAX_TASKS)
            .map(|_| Recorder::new("t", &[Step::Yield], &trace))
            .collect();
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());

        let mut results = Vec::new();
        for (name, body) in names.iter().zip(bodies.iter_mut()) {
            results.push(sched.create_task(TaskSpec::new(name, Priority::LOW), body));
        }
        assert!(results[..MAX_TASKS].iter().all(|r| r.is_ok()));
        assert_eq!(results[MAX_TASKS], Err(Error::ResourceExhausted));
        assert_eq!(sched.task_count(), MAX_TASKS);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Yield], &trace);
        let mut b = Recorder::new("B", &[Step::Yield], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        sched.create_task(TaskSpec::new("same", Priority::LOW), &mut a).unwrap();
        assert_eq!(
            sched.create_task(TaskSpec::new("same", Priority::HIGH), &mut b),
            Err(Error::DuplicateName)
        );
    }

    #[test]
    fn test_corrupted_registry_halts() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Yield], &trace);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let handle = sched.create_task(TaskSpec::new("A", Priority::LOW), &mut a).unwrap();

        sched.table.get_mut(handle).unwrap().runnable = None;
        assert_eq!(
            sched.dispatch_once(),
            Err(Error::InvalidTask {
                slot: handle.index()
            })
        );
        assert_eq!(sched.state(), SchedulerState::Stopped);
        assert!(sched.start().is_err());
    }

    #[test]
    fn test_stop_between_cycles() {
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched: Scheduler<'_, 8> = Scheduler::new(user, SchedulerConfig::default());
        sched.stop();
        assert_eq!(sched.dispatch_once().unwrap(), Dispatch::Stopped);
        assert_eq!(sched.state(), SchedulerState::Stopped);
        assert!(sched.start().is_ok());
    }

    #[test]
    fn test_task_requests_stop() {
        let count = core::cell::Cell::new(0u32);
        let mut counter = |cx: &mut TaskContext<'_>| {
            count.set(count.get() + 1);
            if count.get() == 10 {
                cx.request_stop();
            }
            Step::Yield
        };
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        sched
            .create_task(TaskSpec::new("Task1", Priority::LOW), &mut counter)
            .unwrap();
        sched.start().unwrap();
        assert_eq!(sched.state(), SchedulerState::Stopped);
        drop(sched);
        assert_eq!(count.get(), 10);
    }

    #[test]
    fn test_load_resizes_quanta() {
        let trace = RefCell::new(Vec::new());
        let mut a = Recorder::new("A", &[Step::Yield], &trace);
        let mut sensor = FixedLoad(1.0);
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let config = SchedulerConfig {
            load_sample_interval: 1,
            ..SchedulerConfig::default()
        };
        let mut sched = Scheduler::new(user, config).with_load_sensor(&mut sensor);
        let handle = sched.create_task(TaskSpec::new("A", Priority::LOW), &mut a).unwrap();
        assert_eq!(sched.task(handle).unwrap().time_slice, 10);

        ran(sched.dispatch_once().unwrap());
        assert_eq!(sched.task(handle).unwrap().time_slice, 20);
        assert_eq!(sched.load(), 1.0);
        assert_eq!(sched.stats().load_samples, 1);
    }

    #[test]
    fn test_periodic_deadline_miss() {
        let trace = RefCell::new(Vec::new());
        let mut p = Recorder::new(
            "p",
            &[
                Step::Continue,
                Step::Continue,
                Step::Continue,
                Step::Continue,
                Step::Continue,
                Step::Complete,
                Step::Complete,
            ],
            &trace,
        );
        let mut channel = Channel::<8>::new();
        let (user, _kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let handle = sched
            .create_task(TaskSpec::new("p", Priority::NORMAL).period(4), &mut p)
            .unwrap();

        // Six ticks against a deadline of 4
        let first = ran(sched.dispatch_once().unwrap());
        assert_eq!((first.ticks, first.outcome), (6, Outcome::Completed));
        let info = sched.task(handle).unwrap();
        assert_eq!(info.deadline_misses, 1);
        assert_eq!(info.activations, 1);
        assert_eq!(info.deadline, Some(8));

        // Next release finishes at tick 7, inside its deadline of 8
        let second = ran(sched.dispatch_once().unwrap());
        assert_eq!(second.ticks, 1);
        let info = sched.task(handle).unwrap();
        assert_eq!(info.deadline_misses, 1);
        assert_eq!(info.deadline, Some(12));
        assert_eq!(sched.stats().deadline_misses, 1);
    }

    #[test]
    fn test_task_submits_io() {
        let mut submitter = |cx: &mut TaskContext<'_>| {
            let payload = IoPayload {
                op: 1,
                arg0: cx.arg() as u64,
                arg1: 0,
            };
            cx.submit_io(InterruptClass(4), payload).unwrap();
            Step::Complete
        };
        let mut channel = Channel::<8>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        sched
            .create_task(TaskSpec::new("io", Priority::LOW).arg(77), &mut submitter)
            .unwrap();
        ran(sched.dispatch_once().unwrap());

        let requests: Vec<_> = kernel.drain_requests().collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].class, InterruptClass(4));
        match requests[0].kind {
            RequestKind::IoSubmit { payload } => assert_eq!(payload.arg0, 77),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_register_handler_publishes() {
        let trace = RefCell::new(Vec::new());
        let mut h = Recorder::new("h", &[Step::Block], &trace);
        let mut channel = Channel::<8>::new();
        let (user, mut kernel) = channel.split();
        let mut sched = Scheduler::new(user, SchedulerConfig::default());
        let handle = sched.create_task(TaskSpec::new("h", Priority::LOW), &mut h).unwrap();
        sched.register_handler(InterruptClass(9), handle, 42).unwrap();

        let request = kernel.drain_requests().next().unwrap();
        assert_eq!(request.class, InterruptClass(9));
        assert_eq!(
            request.kind,
            RequestKind::RegisterHandler {
                handler: HandlerRef(handle.to_raw()),
                ctx: 42
            }
        );
    }
}

//! Demo: three counting tasks and a loopback interrupt handler
//!
//! Task1 (priority 1) stops the system once it has counted to 10. Task2
//! (priority 3) submits loopback I/O every third count; the completions come
//! back through the dispatcher thread to the handler task.
//!
//! `RTOS_LOG=debug cargo run --bin edfrr-demo` for more detail.

use edfrr_rtos::{
    Channel, DispatcherConfig, Dispatcher, FixedLoad, InterruptClass, IoPayload, LoopbackIo,
    NoAffinity, Priority, Runnable, Scheduler, SchedulerConfig, Step, TaskContext, TaskSpec,
};
use log::{debug, error, info, warn, LevelFilter, Log, Metadata, Record};

const DISK: InterruptClass = InterruptClass(1);

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging() {
    let level = std::env::var("RTOS_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// What a counter does when it reaches its limit
#[derive(Clone, Copy)]
enum AtLimit {
    Finish,
    StopSystem,
}

struct Counter {
    count: u32,
    limit: u32,
    at_limit: AtLimit,
    io_every: Option<u32>,
}

impl Counter {
    fn new(limit: u32, at_limit: AtLimit) -> Self {
        Self {
            count: 0,
            limit,
            at_limit,
            io_every: None,
        }
    }

    fn with_io_every(mut self, every: u32) -> Self {
        self.io_every = Some(every);
        self
    }
}

impl Runnable for Counter {
    fn run(&mut self, cx: &mut TaskContext<'_>) -> Step {
        self.count += 1;
        info!("{} count = {}", cx.name(), self.count);

        if let Some(every) = self.io_every {
            if self.count % every == 0 {
                let payload = IoPayload {
                    op: 1,
                    arg0: self.count as u64,
                    arg1: 0,
                };
                match cx.submit_io(DISK, payload) {
                    Ok(seq) => debug!("{} submitted request {}", cx.name(), seq.0),
                    Err(err) => warn!("{} could not submit: {}", cx.name(), err),
                }
            }
        }

        if self.count < self.limit {
            return Step::Yield;
        }
        match self.at_limit {
            AtLimit::Finish => Step::Complete,
            AtLimit::StopSystem => {
                info!("{} reached {}, stopping", cx.name(), self.limit);
                cx.request_stop();
                Step::Yield
            }
        }
    }
}

#[derive(Default)]
struct DiskHandler {
    serviced: u32,
}

impl Runnable for DiskHandler {
    fn run(&mut self, cx: &mut TaskContext<'_>) -> Step {
        if let Some(event) = cx.interrupt() {
            self.serviced += 1;
            info!(
                "{} serviced request {}: {:?} (ctx {:#x})",
                cx.name(),
                event.seq.0,
                event.status,
                event.ctx
            );
        }
        Step::Block
    }
}

fn run() -> edfrr_rtos::Result<()> {
    let channel: &'static mut Channel = Box::leak(Box::new(Channel::new()));
    let (user, kernel) = channel.split();
    let worker =
        Dispatcher::new(kernel, LoopbackIo::new(), DispatcherConfig::default()).spawn(NoAffinity)?;

    let mut task1 = Counter::new(10, AtLimit::StopSystem);
    let mut task2 = Counter::new(6, AtLimit::Finish).with_io_every(3);
    let mut task3 = Counter::new(6, AtLimit::Finish);
    let mut handler = DiskHandler::default();
    let mut load = FixedLoad(0.5);

    let mut scheduler =
        Scheduler::new(user, SchedulerConfig::default()).with_load_sensor(&mut load);
    scheduler.create_task(TaskSpec::new("Task1", Priority(1)), &mut task1)?;
    scheduler.create_task(TaskSpec::new("Task2", Priority(3)), &mut task2)?;
    scheduler.create_task(TaskSpec::new("Task3", Priority(2)), &mut task3)?;
    let irq = scheduler.create_task(TaskSpec::new("DiskIrq", Priority::HIGH), &mut handler)?;
    scheduler.register_handler(DISK, irq, 0xD15C)?;

    let result = scheduler.start();
    let stats = scheduler.stats();
    info!(
        "scheduler: {} cycles, {} dispatches, {} context switches, {} interrupts",
        stats.cycles, stats.dispatches, stats.context_switches, stats.interrupts_serviced
    );

    // start() returning early on corruption still needs the worker stopped
    scheduler.stop();
    match worker.join() {
        Ok(kernel) => info!(
            "dispatcher: {} requests, {} submitted, {} posted",
            kernel.requests, kernel.submitted, kernel.posted
        ),
        Err(_) => error!("dispatcher thread panicked"),
    }
    result
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        error!("demo failed: {}", err);
        std::process::exit(1);
    }
}

//! Interrupt dispatcher: the kernel side of the channel
//!
//! Drains the request ring, keeps the class → handler registrations, hands
//! I/O work to an [`AsyncIo`] engine and posts its completions back on the
//! response ring, tagged with the handler that was registered when the
//! request was accepted.
//!
//! Completions are never dropped: when the response ring is full they wait
//! in a FIFO backlog and are retried first on the next cycle. Once the
//! backlog is full too, the engine is simply not polled until it drains.

use heapless::{Deque, FnvIndexMap};
use log::{debug, info, warn};

use crate::channel::{KernelEnd, StopHandle};
use crate::config::{DispatcherConfig, COMPLETION_BACKLOG, MAX_CLASSES, MAX_IN_FLIGHT, RING_CAPACITY};
use crate::irq::{CompletionStatus, HandlerRef, InterruptClass, IoPayload, RequestKind, Response, Seq};

/// Work handed to the I/O engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    /// Correlation id
    pub seq: Seq,
    /// Interrupt class of the request
    pub class: InterruptClass,
    /// Work description
    pub payload: IoPayload,
}

/// Finished work reported by the I/O engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Correlation id of the originating request
    pub seq: Seq,
    /// Result
    pub status: CompletionStatus,
}

/// Out-of-core asynchronous I/O engine
///
/// `submit` must not block; results come back through `poll_completion`.
pub trait AsyncIo {
    /// Start an operation
    fn submit(&mut self, request: IoRequest);

    /// Next finished operation, if any
    fn poll_completion(&mut self) -> Option<Completion>;
}

/// Engine that completes every request on the next poll with
/// `Completed(payload.arg0)`
#[derive(Debug, Default)]
pub struct LoopbackIo {
    done: Deque<Completion, MAX_IN_FLIGHT>,
}

impl LoopbackIo {
    /// Engine with nothing queued
    pub fn new() -> Self {
        Self::default()
    }
}

impl AsyncIo for LoopbackIo {
    fn submit(&mut self, request: IoRequest) {
        let completion = Completion {
            seq: request.seq,
            status: CompletionStatus::Completed(request.payload.arg0),
        };
        if self.done.push_back(completion).is_err() {
            warn!("loopback engine full, seq {} lost", request.seq.0);
        }
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        self.done.pop_front()
    }
}

/// Affinity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    /// The requested core does not exist
    #[error("core {0} does not exist")]
    NoSuchCore(usize),
    /// The platform cannot pin threads
    #[error("thread affinity is not supported here")]
    Unsupported,
}

/// Pins the calling thread to a core
pub trait CoreBinder {
    /// Bind the current thread to `core`
    fn bind_current(&mut self, core: usize) -> Result<(), BindError>;
}

/// Binder that accepts any core and pins nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAffinity;

impl CoreBinder for NoAffinity {
    fn bind_current(&mut self, _core: usize) -> Result<(), BindError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registration {
    handler: HandlerRef,
    ctx: u64,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    class: InterruptClass,
    registration: Registration,
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Requests drained from the request ring
    pub requests: u64,
    /// Handler registrations accepted
    pub registrations: u64,
    /// I/O requests handed to the engine
    pub submitted: u64,
    /// I/O requests dropped because no handler was registered for the class
    pub unrouted: u64,
    /// Completions polled from the engine
    pub completions: u64,
    /// Responses posted on the response ring
    pub posted: u64,
    /// Completions that had to wait in the backlog
    pub held: u64,
    /// Completions that matched no outstanding request
    pub spurious: u64,
}

/// Work done in one [`Dispatcher::cycle`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Requests drained
    pub requests: usize,
    /// Completions polled
    pub completions: usize,
    /// Responses posted
    pub posted: usize,
}

impl CycleReport {
    /// Nothing moved this cycle
    pub fn is_quiet(&self) -> bool {
        self.requests == 0 && self.completions == 0 && self.posted == 0
    }
}

/// Kernel-side interrupt dispatcher
pub struct Dispatcher<'a, A, const N: usize = RING_CAPACITY> {
    end: KernelEnd<'a, N>,
    io: A,
    handlers: FnvIndexMap<InterruptClass, Registration, MAX_CLASSES>,
    in_flight: FnvIndexMap<Seq, InFlight, MAX_IN_FLIGHT>,
    backlog: Deque<Response, COMPLETION_BACKLOG>,
    config: DispatcherConfig,
    stats: DispatcherStats,
}

impl<'a, A: AsyncIo, const N: usize> Dispatcher<'a, A, N> {
    /// Dispatcher on the kernel end of a channel
    pub fn new(end: KernelEnd<'a, N>, io: A, config: DispatcherConfig) -> Self {
        Self {
            end,
            io,
            handlers: FnvIndexMap::new(),
            in_flight: FnvIndexMap::new(),
            backlog: Deque::new(),
            config,
            stats: DispatcherStats::default(),
        }
    }

    /// One pass: route requests, flush held responses, collect completions
    pub fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        self.route_requests(&mut report);
        self.flush_backlog(&mut report);
        self.collect_completions(&mut report);
        report
    }

    fn route_requests(&mut self, report: &mut CycleReport) {
        let Self {
            end,
            io,
            handlers,
            in_flight,
            stats,
            ..
        } = self;

        // Leave requests on the ring rather than lose track of them
        let room = MAX_IN_FLIGHT - in_flight.len();
        for request in end.drain_requests().take(room) {
            stats.requests += 1;
            report.requests += 1;

            match request.kind {
                RequestKind::RegisterHandler { handler, ctx } => {
                    let registration = Registration { handler, ctx };
                    match handlers.insert(request.class, registration) {
                        Ok(Some(previous)) => debug!(
                            "class {} handler replaced ({:?} -> {:?})",
                            request.class.0, previous.handler, handler
                        ),
                        Ok(None) => info!("class {} routed to {:?}", request.class.0, handler),
                        Err(_) => {
                            warn!(
                                "handler table full, registration for class {} dropped",
                                request.class.0
                            );
                            continue;
                        }
                    }
                    stats.registrations += 1;
                }
                RequestKind::IoSubmit { payload } => {
                    let Some(registration) = handlers.get(&request.class).copied() else {
                        warn!(
                            "no handler for class {}, dropping request {}",
                            request.class.0, request.seq.0
                        );
                        stats.unrouted += 1;
                        continue;
                    };
                    let entry = InFlight {
                        class: request.class,
                        registration,
                    };
                    // Cannot overflow: at most `room` requests are drained
                    let _ = in_flight.insert(request.seq, entry);
                    io.submit(IoRequest {
                        seq: request.seq,
                        class: request.class,
                        payload,
                    });
                    stats.submitted += 1;
                }
            }
        }
    }

    /// Post held responses in arrival order until the ring fills
    fn flush_backlog(&mut self, report: &mut CycleReport) {
        while let Some(response) = self.backlog.front().copied() {
            if !self.end.post(response) {
                break;
            }
            self.backlog.pop_front();
            self.stats.posted += 1;
            report.posted += 1;
        }
    }

    fn collect_completions(&mut self, report: &mut CycleReport) {
        while !self.backlog.is_full() {
            let Some(completion) = self.io.poll_completion() else {
                break;
            };
            self.stats.completions += 1;
            report.completions += 1;

            let Some(entry) = self.in_flight.remove(&completion.seq) else {
                warn!("completion for unknown request {}", completion.seq.0);
                self.stats.spurious += 1;
                continue;
            };
            let response = Response {
                seq: completion.seq,
                class: entry.class,
                status: completion.status,
                handler: entry.registration.handler,
                ctx: entry.registration.ctx,
            };

            // Anything already held goes first
            if self.backlog.is_empty() && self.end.post(response) {
                self.stats.posted += 1;
                report.posted += 1;
                continue;
            }
            debug!("response ring full, holding completion {}", completion.seq.0);
            self.stats.held += 1;
            // Cannot fail: the loop only runs while the backlog has room
            let _ = self.backlog.push_back(response);
        }
    }

    /// Cycle until a stop is requested, sleeping on the doorbell when quiet
    pub fn run(&mut self) -> DispatcherStats {
        info!("interrupt dispatcher running");
        while !self.end.stop_requested() {
            if self.cycle().is_quiet() {
                self.end.wait(self.config.poll_interval);
            }
        }
        info!(
            "interrupt dispatcher stopped: {} requests, {} responses posted, {} held",
            self.stats.requests,
            self.stats.posted,
            self.backlog.len()
        );
        self.stats
    }

    /// Pin the calling thread to the configured core, if any
    ///
    /// Best effort: failure is logged and the dispatcher keeps running.
    pub fn bind_core(&self, binder: &mut dyn CoreBinder) {
        let Some(core) = self.config.core else {
            return;
        };
        match binder.bind_current(core) {
            Ok(()) => info!("interrupt dispatcher pinned to core {}", core),
            Err(err) => warn!("could not pin interrupt dispatcher to core {}: {}", core, err),
        }
    }

    /// Handler currently registered for `class`
    pub fn handler_for(&self, class: InterruptClass) -> Option<(HandlerRef, u64)> {
        self.handlers
            .get(&class)
            .map(|registration| (registration.handler, registration.ctx))
    }

    /// I/O requests awaiting completion
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Responses waiting for room on the response ring
    pub fn held(&self) -> usize {
        self.backlog.len()
    }

    /// Handle that stops both loops
    pub fn stop_handle(&self) -> StopHandle<'a> {
        self.end.stop_handle()
    }

    /// The I/O engine
    pub fn io_mut(&mut self) -> &mut A {
        &mut self.io
    }

    /// Counters
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }
}

#[cfg(feature = "std")]
impl<A, const N: usize> Dispatcher<'static, A, N>
where
    A: AsyncIo + Send + 'static,
{
    /// Move the dispatcher onto its own worker thread
    ///
    /// The thread pins itself with `binder`, then runs until a stop is
    /// requested and returns its counters.
    pub fn spawn<B>(
        mut self,
        mut binder: B,
    ) -> crate::error::Result<std::thread::JoinHandle<DispatcherStats>>
    where
        B: CoreBinder + Send + 'static,
    {
        std::thread::Builder::new()
            .name("irq-dispatch".into())
            .spawn(move || {
                self.bind_core(&mut binder);
                self.run()
            })
            .map_err(|err| {
                log::error!("failed to spawn interrupt dispatcher: {}", err);
                crate::error::Error::WorkerSpawn
            })
    }
}

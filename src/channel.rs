//! User/kernel interrupt channel
//!
//! The shared region between the two contexts: a request ring (user
//! produces, kernel consumes), a response ring (kernel produces, user
//! consumes), one doorbell per side, and the shutdown flag both loops poll
//! between cycles.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use crate::config::RING_CAPACITY;
use crate::error::{Error, Result};
use crate::irq::{InterruptClass, Request, RequestKind, Response, Seq};
use crate::ring::{Consumer, DrainBatch, InterruptRing, Producer};

/// Wake primitive for an idle loop
///
/// Ringing is sticky: a ring that lands before `wait` makes the next `wait`
/// return immediately, so a check-then-wait sequence can't lose a wakeup.
#[derive(Debug, Default)]
pub struct Doorbell {
    #[cfg(feature = "std")]
    rung: parking_lot::Mutex<bool>,
    #[cfg(feature = "std")]
    signal: parking_lot::Condvar,
    #[cfg(not(feature = "std"))]
    rung: AtomicBool,
}

impl Doorbell {
    /// Unrung doorbell
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the waiting side
    #[cfg(feature = "std")]
    pub fn ring(&self) {
        let mut rung = self.rung.lock();
        *rung = true;
        self.signal.notify_one();
    }

    /// Block until rung or `timeout` passes. Returns whether it was rung.
    #[cfg(feature = "std")]
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut rung = self.rung.lock();
        if !*rung {
            let _ = self.signal.wait_for(&mut rung, timeout);
        }
        core::mem::replace(&mut *rung, false)
    }

    /// Wake the waiting side
    #[cfg(not(feature = "std"))]
    pub fn ring(&self) {
        self.rung.store(true, Ordering::Release);
    }

    /// Spin until rung, roughly one spin per microsecond of `timeout`.
    /// Returns whether it was rung.
    #[cfg(not(feature = "std"))]
    pub fn wait(&self, timeout: Duration) -> bool {
        let spins = timeout.as_micros().clamp(1, 1 << 20) as u32;
        for _ in 0..spins {
            if self.rung.swap(false, Ordering::Acquire) {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }
}

/// Stops both loops
///
/// Copyable and shareable across threads; the flag is observed between
/// dispatch cycles.
#[derive(Debug, Clone, Copy)]
pub struct StopHandle<'a> {
    shutdown: &'a AtomicBool,
    bells: [&'a Doorbell; 2],
}

impl StopHandle<'_> {
    /// Raise the stop flag and wake both sides
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        for bell in self.bells {
            bell.ring();
        }
    }

    /// Has a stop been requested?
    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Anything that can put a request on the request ring
pub trait RequestPort {
    /// Publish a request and return its sequence number
    ///
    /// Fails with [`Error::ChannelOverflow`] when the ring is full.
    fn submit(&mut self, class: InterruptClass, kind: RequestKind) -> Result<Seq>;
}

/// Shared memory between the user and kernel contexts
#[derive(Debug)]
pub struct Channel<const N: usize = RING_CAPACITY> {
    requests: InterruptRing<Request, N>,
    responses: InterruptRing<Response, N>,
    kernel_bell: Doorbell,
    user_bell: Doorbell,
    shutdown: AtomicBool,
}

impl<const N: usize> Channel<N> {
    /// Empty channel
    pub fn new() -> Self {
        Self {
            requests: InterruptRing::new(),
            responses: InterruptRing::new(),
            kernel_bell: Doorbell::new(),
            user_bell: Doorbell::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Split into the user end (scheduler) and kernel end (dispatcher)
    ///
    /// Clears any earlier stop request.
    pub fn split(&mut self) -> (UserEnd<'_, N>, KernelEnd<'_, N>) {
        *self.shutdown.get_mut() = false;

        let (request_tx, request_rx) = self.requests.split();
        let (response_tx, response_rx) = self.responses.split();
        let stop = StopHandle {
            shutdown: &self.shutdown,
            bells: [&self.kernel_bell, &self.user_bell],
        };

        let user = UserEnd {
            requests: request_tx,
            responses: response_rx,
            stop,
            kernel_bell: &self.kernel_bell,
            user_bell: &self.user_bell,
            next_seq: 0,
        };
        let kernel = KernelEnd {
            requests: request_rx,
            responses: response_tx,
            stop,
            kernel_bell: &self.kernel_bell,
            user_bell: &self.user_bell,
        };
        (user, kernel)
    }
}

impl<const N: usize> Default for Channel<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// User side: produces requests, consumes responses
pub struct UserEnd<'a, const N: usize = RING_CAPACITY> {
    requests: Producer<'a, Request, N>,
    responses: Consumer<'a, Response, N>,
    stop: StopHandle<'a>,
    kernel_bell: &'a Doorbell,
    user_bell: &'a Doorbell,
    next_seq: u32,
}

impl<'a, const N: usize> UserEnd<'a, N> {
    /// Publish a fully formed request. Returns false if the ring is full.
    pub fn publish(&mut self, request: Request) -> bool {
        let accepted = self.requests.publish(request);
        if accepted {
            self.kernel_bell.ring();
        }
        accepted
    }

    /// Snapshot of responses posted by the kernel side
    pub fn drain_responses(&mut self) -> DrainBatch<'_, Response, N> {
        self.responses.drain_batch()
    }

    /// Are responses waiting on the ring?
    pub fn has_responses(&self) -> bool {
        !self.responses.is_empty()
    }

    /// Requests not yet drained by the kernel side
    pub fn requests_in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Handle that stops both loops
    pub fn stop_handle(&self) -> StopHandle<'a> {
        self.stop
    }

    /// Has a stop been requested?
    pub fn stop_requested(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Wait for the kernel side to post a response (or a stop)
    pub fn wait(&self, timeout: Duration) -> bool {
        self.user_bell.wait(timeout)
    }
}

impl<const N: usize> RequestPort for UserEnd<'_, N> {
    fn submit(&mut self, class: InterruptClass, kind: RequestKind) -> Result<Seq> {
        let seq = Seq(self.next_seq);
        if !self.publish(Request { seq, class, kind }) {
            return Err(Error::ChannelOverflow);
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(seq)
    }
}

/// Kernel side: consumes requests, produces responses
pub struct KernelEnd<'a, const N: usize = RING_CAPACITY> {
    requests: Consumer<'a, Request, N>,
    responses: Producer<'a, Response, N>,
    stop: StopHandle<'a>,
    kernel_bell: &'a Doorbell,
    user_bell: &'a Doorbell,
}

impl<'a, const N: usize> KernelEnd<'a, N> {
    /// Snapshot of requests published by the user side
    pub fn drain_requests(&mut self) -> DrainBatch<'_, Request, N> {
        self.requests.drain_batch()
    }

    /// Post a response. Returns false if the response ring is full.
    pub fn post(&mut self, response: Response) -> bool {
        let posted = self.responses.publish(response);
        if posted {
            self.user_bell.ring();
        }
        posted
    }

    /// Handle that stops both loops
    pub fn stop_handle(&self) -> StopHandle<'a> {
        self.stop
    }

    /// Has a stop been requested?
    pub fn stop_requested(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Wait for the user side to publish a request (or a stop)
    pub fn wait(&self, timeout: Duration) -> bool {
        self.kernel_bell.wait(timeout)
    }
}

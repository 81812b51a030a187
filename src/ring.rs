//! Lock-free SPSC interrupt ring
//!
//! Fixed-capacity circular buffer shared by exactly one producer and one
//! consumer. No heap, no mutex, no critical sections.
//!
//! `head` (next slot to write) and `tail` (next slot to read) are free-running
//! counters; the slot index is `counter & (N - 1)`. The ring is empty when
//! `head == tail` and full when `head - tail == N`, so all `N` slots are
//! usable. Each counter has a single writer: the producer stores `head`, the
//! consumer stores `tail`.
//!
//! A producer writes the slot first and then publishes it with a `Release`
//! store of `head`; a consumer loads `head` with `Acquire` before touching any
//! slot below it. The consumer hands slots back with a `Release` store of
//! `tail`, which the producer loads with `Acquire` before overwriting.

use core::iter::FusedIterator;
use core::mem::MaybeUninit;

use crate::loom::{AtomicUsize, Ordering, UnsafeCell};

/// Lock-free SPSC ring buffer
///
/// `N` must be a power of two. Entries are `Copy`: they are plain records
/// that are never mutated after being published.
pub struct InterruptRing<T, const N: usize> {
    /// Slot storage
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    /// Next slot to write (owned by producer)
    head: AtomicUsize,
    /// Next slot to read (owned by consumer)
    tail: AtomicUsize,
}

// SAFETY: a slot is written only by the single producer while it lies in
// `tail + N > head` free space, and read only by the single consumer after
// the Release/Acquire pair on `head` made the write visible. `split` hands
// out exactly one producer and one consumer.
unsafe impl<T: Send, const N: usize> Sync for InterruptRing<T, N> {}

impl<T: Copy, const N: usize> InterruptRing<T, N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        N - 1
    };

    /// Create a new empty ring
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        let _ = Self::MASK;
        Self {
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Create a new empty ring
    #[cfg(loom)]
    pub fn new() -> Self {
        let _ = Self::MASK;
        Self {
            slots: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Split into the producer and consumer ends
    ///
    /// The exclusive borrow guarantees there is only ever one of each.
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        let ring = &*self;
        (Producer { ring }, Consumer { ring })
    }

    /// Slot count
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Entries published but not yet consumed
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Is the ring empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(not(loom))]
impl<T: Copy, const N: usize> Default for InterruptRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> core::fmt::Debug for InterruptRing<T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InterruptRing")
            .field("capacity", &N)
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

/// Producer end: owns `head`
pub struct Producer<'a, T, const N: usize> {
    ring: &'a InterruptRing<T, N>,
}

impl<'a, T: Copy, const N: usize> Producer<'a, T, N> {
    /// Publish one entry
    ///
    /// Returns false if the ring is full; the caller retries or drops.
    /// Never blocks.
    pub fn publish(&mut self, entry: T) -> bool {
        let ring = self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= N {
            return false;
        }

        ring.slots[head & InterruptRing::<T, N>::MASK].with_mut(|slot| {
            // SAFETY: `head - tail < N`, so the consumer has released this
            // slot and won't read it until `head` moves past it.
            unsafe {
                (*slot).write(entry);
            }
        });

        ring.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Entries in flight
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Is the ring empty?
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Is the ring full?
    pub fn is_full(&self) -> bool {
        self.ring.len() >= N
    }
}

/// Consumer end: owns `tail`
pub struct Consumer<'a, T, const N: usize> {
    ring: &'a InterruptRing<T, N>,
}

impl<'a, T: Copy, const N: usize> Consumer<'a, T, N> {
    /// Take a snapshot of the published entries
    ///
    /// The batch yields entries from `tail` up to the `head` observed now and
    /// never past it. `tail` advances by the number of entries actually
    /// consumed when the batch is dropped.
    pub fn drain_batch(&mut self) -> DrainBatch<'_, T, N> {
        let start = self.ring.tail.load(Ordering::Relaxed);
        let end = self.ring.head.load(Ordering::Acquire);
        DrainBatch {
            ring: self.ring,
            start,
            pos: start,
            end,
        }
    }

    /// Entries waiting
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Is anything waiting?
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Lazy, finite batch of entries from one [`Consumer::drain_batch`] call
pub struct DrainBatch<'c, T, const N: usize> {
    ring: &'c InterruptRing<T, N>,
    start: usize,
    pos: usize,
    end: usize,
}

impl<T: Copy, const N: usize> Iterator for DrainBatch<'_, T, N> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.pos == self.end {
            return None;
        }
        let value = self.ring.slots[self.pos & InterruptRing::<T, N>::MASK].with(|slot| {
            // SAFETY: `pos < end <= head` (Acquire), so the producer's write
            // of this slot is visible and it won't be overwritten before
            // `tail` is released past it.
            unsafe { (*slot).assume_init_read() }
        });
        self.pos = self.pos.wrapping_add(1);
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.end.wrapping_sub(self.pos);
        (left, Some(left))
    }
}

impl<T: Copy, const N: usize> ExactSizeIterator for DrainBatch<'_, T, N> {}

impl<T: Copy, const N: usize> FusedIterator for DrainBatch<'_, T, N> {}

impl<T, const N: usize> Drop for DrainBatch<'_, T, N> {
    fn drop(&mut self) {
        if self.pos != self.start {
            self.ring.tail.store(self.pos, Ordering::Release);
        }
    }
}

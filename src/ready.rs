//! Ready queue
//!
//! Tasks waiting for the CPU, kept sorted by descending priority and then by
//! ascending absolute deadline. Equal keys keep insertion order, which gives
//! round-robin among tasks that keep yielding back into the queue.
//!
//! Insert and removal are O(n) scans over a fixed array. That is fine for
//! [`MAX_TASKS`] entries and is the known scaling limit of this queue.

use crate::config::MAX_TASKS;
use crate::task::{Priority, TaskHandle};

/// One queued task and the ordering key it was inserted with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEntry {
    /// Queued task
    pub handle: TaskHandle,
    /// Priority at insertion
    pub priority: Priority,
    /// Absolute deadline at insertion (`u64::MAX` = none)
    pub due: u64,
}

impl ReadyEntry {
    /// Should `self` run before `other`?
    fn outranks(&self, other: &ReadyEntry) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.due < other.due)
    }
}

/// Priority/EDF ordered ready queue
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: heapless::Vec<ReadyEntry, MAX_TASKS>,
}

impl ReadyQueue {
    /// Empty queue
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Insert behind every entry that outranks or ties with `entry`
    ///
    /// Hands the entry back if the queue is full or already holds the task.
    pub fn insert(&mut self, entry: ReadyEntry) -> Result<(), ReadyEntry> {
        if self.contains(entry.handle) {
            return Err(entry);
        }
        let pos = self
            .entries
            .iter()
            .position(|queued| entry.outranks(queued))
            .unwrap_or(self.entries.len());
        self.entries.push(entry)?;
        self.entries[pos..].rotate_right(1);
        Ok(())
    }

    /// Pop the most urgent entry
    pub fn remove_head(&mut self) -> Option<ReadyEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.entries.rotate_left(1);
        self.entries.pop()
    }

    /// Unlink a task wherever it sits. Returns false if it was not queued.
    pub fn remove(&mut self, handle: TaskHandle) -> bool {
        match self.entries.iter().position(|e| e.handle == handle) {
            Some(pos) => {
                self.entries[pos..].rotate_left(1);
                self.entries.pop();
                true
            }
            None => false,
        }
    }

    /// Most urgent entry without removing it
    pub fn peek(&self) -> Option<&ReadyEntry> {
        self.entries.first()
    }

    /// Is the task queued?
    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.entries.iter().any(|e| e.handle == handle)
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

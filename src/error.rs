//! Crate error type

use crate::task::TaskHandle;

/// Errors reported by scheduler and channel operations
///
/// Everything except [`Error::InvalidTask`] is recoverable: the caller backs
/// off or retries. `InvalidTask` means the scheduler's own bookkeeping is
/// corrupted and the dispatch loop halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A fixed-capacity table (tasks, pending responses, registrations) is full
    #[error("resource exhausted")]
    ResourceExhausted,
    /// Handle does not name a live task
    #[error("invalid task handle {0}")]
    InvalidHandle(TaskHandle),
    /// Registry entry is structurally broken
    #[error("corrupted task registry entry in slot {slot}")]
    InvalidTask {
        /// Task table slot that failed validation
        slot: usize,
    },
    /// Ring publish rejected because the ring is full
    #[error("interrupt channel overflow")]
    ChannelOverflow,
    /// Another live task already uses this name
    #[error("task name already registered")]
    DuplicateName,
    /// The dispatcher worker thread could not be started
    #[cfg(feature = "std")]
    #[error("failed to spawn interrupt dispatcher worker")]
    WorkerSpawn,
}

/// Crate result alias
pub type Result<T> = core::result::Result<T, Error>;

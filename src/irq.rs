//! Interrupt request and response records
//!
//! These are the plain-data entries carried by the two rings. Payloads are
//! opaque words; only their queuing and correlation matter here.

/// Interrupt class a handler registers for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterruptClass(pub u16);

/// Request sequence number, used to correlate responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(pub u32);

/// Opaque reference to a user-side handler (a packed task handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef(pub u32);

/// Opaque I/O payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoPayload {
    /// Operation code
    pub op: u32,
    /// First argument word
    pub arg0: u64,
    /// Second argument word
    pub arg1: u64,
}

/// What a request asks the kernel side to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Route future requests of this class to `handler`, replacing any
    /// earlier registration
    RegisterHandler {
        /// Handler to receive responses
        handler: HandlerRef,
        /// User context echoed back with every response
        ctx: u64,
    },
    /// Hand work to the asynchronous I/O engine
    IoSubmit {
        /// Work description
        payload: IoPayload,
    },
}

/// User → kernel ring entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Sequence number assigned by the user side
    pub seq: Seq,
    /// Interrupt class
    pub class: InterruptClass,
    /// Request body
    pub kind: RequestKind,
}

/// Outcome of an asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Finished with a result word
    Completed(u64),
    /// Failed with an error code
    Failed(u32),
}

/// Kernel → user ring entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Sequence number of the originating request
    pub seq: Seq,
    /// Interrupt class of the originating request
    pub class: InterruptClass,
    /// Completion status
    pub status: CompletionStatus,
    /// Handler registered for the class when the request was accepted
    pub handler: HandlerRef,
    /// Context registered with the handler
    pub ctx: u64,
}

/// A serviced response as seen by the handler task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEvent {
    /// Interrupt class
    pub class: InterruptClass,
    /// Sequence number of the originating request
    pub seq: Seq,
    /// Completion status
    pub status: CompletionStatus,
    /// Context registered with the handler
    pub ctx: u64,
}

impl From<&Response> for InterruptEvent {
    fn from(response: &Response) -> Self {
        Self {
            class: response.class,
            seq: response.seq,
            status: response.status,
            ctx: response.ctx,
        }
    }
}

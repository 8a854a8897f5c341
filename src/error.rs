//! Error taxonomy for the write session.
//!
//! `OperationError` is what travels through an individual operation's or batch's
//! completion channel; `ConfigError` is what the session's configuration setters
//! return synchronously; `Throttled` is a backpressure signal rather than a true
//! error, returned from `apply` when buffering an operation required flushing a
//! tablet's previous batch while an even earlier one was still in flight.

use crate::batch::SharedBatchFuture;
use crate::operation::OperationFuture;
use std::fmt;

/// Backpressure signal returned from `apply`: the operation was buffered
/// successfully into a fresh batch — `op` is its ordinary completion future,
/// unaffected — but doing so required flushing the tablet's previous batch while
/// an even earlier one was still in flight. Callers are expected to await `until`
/// before issuing more writes against that tablet.
pub struct Throttled {
    pub op: OperationFuture,
    pub until: SharedBatchFuture,
}

impl fmt::Debug for Throttled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttled").finish_non_exhaustive()
    }
}

/// Errors delivered through an `Operation`'s or `Batch`'s completion channel.
/// `Clone` because a single server response can fail every operation in a batch at
/// once.
#[derive(thiserror::Error, Debug, Clone)]
pub enum OperationError {
    #[error("tablet's accumulating buffer is full")]
    BufferFull,

    #[error("operation exhausted its retry budget")]
    RetryExhausted,

    #[error("dispatcher returned a malformed response: {0}")]
    InvalidResponse(String),

    #[error("server error {code}: {message}")]
    ServerError { code: i32, message: String },

    #[error("transport error: {0}")]
    TransportError(String),
}

/// Errors returned from configuration setters.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Raised when a setter that requires an empty session (no accumulating,
    /// in-flight, or pending-lookup operations) is called while the session still
    /// has state.
    #[error("invalid argument: flush mode cannot change while operations are buffered or in flight")]
    NotEmpty,
}

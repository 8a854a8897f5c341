//! External-consistency tracking.
//!
//! A tablet server's write response may carry back a timestamp that the caller must
//! propagate to later reads for read-your-writes guarantees. The session doesn't
//! interpret the timestamp itself — it just hands it to whatever the application wired
//! up as its `ConsistencyTracker`.

/// Tag carried on every `Operation`/`Batch` describing how strongly the caller wants
/// writes ordered with respect to earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    /// No cross-write ordering is requested.
    #[default]
    None,
    /// The caller wants later reads to observe at least this write (client-propagated).
    ClientPropagated,
    /// The caller wants the write linearized against a deadline-bounded window.
    LinearizedWithDeadline,
}

/// Opaque write timestamp returned by a tablet server. Treated as a total order by the
/// session; only `ConsistencyTracker` implementations interpret the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriteTimestamp(pub i64);

/// Consumed interface: records the most recent propagated write timestamp so the
/// application can thread it into subsequent reads.
pub trait ConsistencyTracker: Send + Sync {
    fn update_last_propagated_timestamp(&self, ts: WriteTimestamp);
}

/// No-op tracker for callers that don't care about external consistency.
#[derive(Debug, Default)]
pub struct NullConsistencyTracker;

impl ConsistencyTracker for NullConsistencyTracker {
    fn update_last_propagated_timestamp(&self, _ts: WriteTimestamp) {}
}

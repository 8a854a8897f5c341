//! Session configuration: what governs buffering, flushing and retry behavior for a
//! `Session`.

use crate::consistency::ConsistencyMode;
use std::time::Duration;

/// Governs when buffered operations actually reach the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Every `apply` dispatches immediately; nothing is buffered.
    Sync,
    /// Operations accumulate per tablet and flush on a timer or once a tablet's
    /// buffer fills.
    Background,
    /// Operations accumulate per tablet; only an explicit `flush()`/`flush_tablet()`
    /// call drains them. A full buffer is a hard error rather than a trigger to flush.
    Manual,
}

/// Relative priority hint attached to dispatched operations. The dispatcher decides
/// what, if anything, to do with it; the session only threads it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// Per-tablet accumulating-batch size limit (operations, not bytes).
    pub buffer_size_limit: usize,
    /// How long a `Background` batch sits before `FlusherTask` flushes it.
    pub flush_interval: Duration,
    /// Per-operation dispatch timeout; `None` means no deadline.
    pub timeout: Option<Duration>,
    pub consistency_mode: ConsistencyMode,
    pub priority: Priority,
    /// Ceiling on lookup/dispatch retry attempts before an operation fails with
    /// `RetryExhausted`.
    pub max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Background,
            buffer_size_limit: 1000,
            flush_interval: Duration::from_millis(100),
            timeout: Some(Duration::from_secs(10)),
            consistency_mode: ConsistencyMode::default(),
            priority: Priority::default(),
            max_attempts: 10,
        }
    }
}

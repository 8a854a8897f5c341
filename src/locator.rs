//! Tablet-location resolution, consumed via a trait only: this crate never resolves a
//! row key to a tablet itself. The session treats the locator's own cache as read-only
//! and never mutates it directly.

use crate::operation::{Operation, TableId, TabletId};
use futures_util::future::BoxFuture;

/// What a fresh lookup resolved to. `Recoverable` covers a condition short of a hard
/// failure (e.g. a tablet mid-split) that `classify_lookup_failure` may know how to
/// wait out rather than treat as a terminal error.
#[derive(Debug, Clone)]
pub enum LocateResult {
    Tablet(TabletId),
    Recoverable(String),
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum LocatorError {
    #[error("tablet lookup failed: {0}")]
    Failed(String),
}

/// A future the retry continuation awaits before retrying.
pub type RecoveryFuture = BoxFuture<'static, Result<(), LocatorError>>;

/// Consumed interface: supplied by the application, never implemented in this crate.
#[async_trait::async_trait]
pub trait TabletLocator: Send + Sync {
    /// Non-blocking cache probe; never performs I/O.
    fn cached_tablet(&self, table: &TableId, key: &[u8]) -> Option<TabletId>;

    /// Resolves `(table, key)` to a tablet, possibly over the network.
    async fn locate(&self, table: &TableId, key: &[u8]) -> Result<LocateResult, LocatorError>;

    /// True if the table is known not to exist (yet).
    fn is_table_not_served(&self, table: &TableId) -> bool;

    /// Resolves once the table has been created.
    async fn wait_for_table_creation(&self, table: &TableId) -> Result<(), LocatorError>;

    /// Given a lookup outcome that wasn't a clean tablet resolution, decides whether
    /// there's a specific condition to wait out before retrying. `None` means "just
    /// retry"; `Some(fut)` means "await this, then retry".
    async fn classify_lookup_failure(
        &self,
        op: &Operation,
        result: &LocateResult,
    ) -> Option<RecoveryFuture>;
}

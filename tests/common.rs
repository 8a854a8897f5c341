//! Shared fixtures for the integration suite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tablet_session::dispatcher::{DispatchError, RpcDispatcher, WriteResponse};
use tablet_session::locator::{LocateResult, LocatorError, RecoveryFuture, TabletLocator};
use tablet_session::operation::{Operation, PerRowError, TableId, TabletId};

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt().with_env_filter("trace").try_init();
}

/// A `TabletLocator` whose cache is populated up front and whose async `locate`
/// always succeeds with whatever tablet the cache would have returned.
#[derive(Default)]
pub struct FixtureLocator {
    cached: Mutex<HashMap<TableId, TabletId>>,
    not_served: Mutex<HashSet<TableId>>,
    pub locate_calls: AtomicUsize,
}

impl FixtureLocator {
    pub fn with_tablet(table: &str, tablet: &str) -> Arc<FixtureLocator> {
        let locator = FixtureLocator::default();
        locator.cached.lock().insert(table.into(), tablet.into());
        Arc::new(locator)
    }

    pub fn uncached() -> Arc<FixtureLocator> {
        Arc::new(FixtureLocator::default())
    }
}

#[async_trait::async_trait]
impl TabletLocator for FixtureLocator {
    fn cached_tablet(&self, table: &TableId, _key: &[u8]) -> Option<TabletId> {
        self.cached.lock().get(table).cloned()
    }

    async fn locate(&self, table: &TableId, _key: &[u8]) -> Result<LocateResult, LocatorError> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        let tablet = self.cached.lock().get(table).cloned().unwrap_or_else(|| "default-tablet".into());
        Ok(LocateResult::Tablet(tablet))
    }

    fn is_table_not_served(&self, table: &TableId) -> bool {
        self.not_served.lock().contains(table)
    }

    async fn wait_for_table_creation(&self, table: &TableId) -> Result<(), LocatorError> {
        self.not_served.lock().remove(table);
        Ok(())
    }

    async fn classify_lookup_failure(
        &self,
        _op: &Operation,
        _result: &LocateResult,
    ) -> Option<RecoveryFuture> {
        None
    }
}

/// An `RpcDispatcher` that records every call it receives and answers with a
/// configurable `WriteResponse`, optionally stalling `send_batch` until released —
/// used to force an overlapping-flush / throttle scenario deterministically.
pub struct FixtureDispatcher {
    pub solo_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub per_row_errors: Mutex<Vec<PerRowError>>,
    stall: Arc<tokio::sync::Notify>,
    should_stall: std::sync::atomic::AtomicBool,
}

impl Default for FixtureDispatcher {
    fn default() -> Self {
        FixtureDispatcher {
            solo_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            per_row_errors: Mutex::new(Vec::new()),
            stall: Arc::new(tokio::sync::Notify::new()),
            should_stall: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl FixtureDispatcher {
    pub fn stall_next_batch(&self) {
        self.should_stall.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.stall.notify_waiters();
    }
}

#[async_trait::async_trait]
impl RpcDispatcher for FixtureDispatcher {
    async fn send_operation(&self, _op: &Operation) -> Result<WriteResponse, DispatchError> {
        self.solo_calls.fetch_add(1, Ordering::SeqCst);
        Ok(WriteResponse::default())
    }

    async fn send_batch(&self, batch: &tablet_session::batch::Batch) -> Result<WriteResponse, DispatchError> {
        if self.should_stall.swap(false, Ordering::SeqCst) {
            self.stall.notified().await;
        }
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let _ = batch.len();
        Ok(WriteResponse {
            per_row_errors: self.per_row_errors.lock().clone(),
            ..Default::default()
        })
    }
}

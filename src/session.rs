//! The write session: the state machine that accepts `Operation`s, buffers them per
//! tablet into `Batch`es, flushes on size/time/explicit triggers, and completes them
//! from dispatcher responses.
//!
//! One mutex guards all session state; everything that happens while it's held is
//! non-blocking, and any real work (a dispatcher call, a timer registration) is handed
//! off to a spawned task before the lock is released. `accumulating` and `in_flight`
//! live together per tablet in a single map, since a tablet's next batch is allowed to
//! start forming while its previous one is still on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, FutureExt};
use parking_lot::Mutex;

use crate::batch::{complete_ops, Batch, SharedBatchFuture};
use crate::config::{FlushMode, SessionConfig};
use crate::consistency::ConsistencyTracker;
use crate::dispatcher::{RpcDispatcher, WriteResponse};
use crate::error::{ConfigError, OperationError, Throttled};
use crate::locator::{LocateResult, LocatorError, TabletLocator};
use crate::operation::{Operation, OperationFuture, RowKey, TableId, TabletId};
use crate::scheduler::Scheduler;

/// Per-tablet state: the batch still accumulating new ops (if any) and the batch
/// currently dispatched to the server (if any). Both may be populated at once — a
/// fresh batch is allowed to form while the previous one is in flight.
#[derive(Default)]
struct TabletState {
    accumulating: Option<(Batch, SharedBatchFuture)>,
    in_flight: Option<SharedBatchFuture>,
}

impl TabletState {
    fn is_empty(&self) -> bool {
        self.accumulating.is_none() && self.in_flight.is_none()
    }
}

struct State {
    config: SessionConfig,
    tablets: HashMap<TabletId, TabletState>,
    pending_lookup: Vec<Operation>,
}

impl State {
    fn is_empty(&self) -> bool {
        self.pending_lookup.is_empty() && self.tablets.values().all(TabletState::is_empty)
    }
}

struct Inner {
    state: Mutex<State>,
    locator: Arc<dyn TabletLocator>,
    dispatcher: Arc<dyn RpcDispatcher>,
    consistency: Arc<dyn ConsistencyTracker>,
    scheduler: Scheduler,
    next_op_id: AtomicU64,
}

/// Snapshot of a session's internal buffering state, for tests that want to assert
/// on it directly rather than inferring it from timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub accumulating_tablets: usize,
    pub in_flight_tablets: usize,
    pub pending_lookup: usize,
}

/// The client-side write session. Cheap to clone — every clone shares the same
/// underlying state, locator, dispatcher and scheduler.
#[derive(Clone)]
pub struct Session(Arc<Inner>);

impl Session {
    pub fn new(
        config: SessionConfig,
        locator: Arc<dyn TabletLocator>,
        dispatcher: Arc<dyn RpcDispatcher>,
        consistency: Arc<dyn ConsistencyTracker>,
    ) -> Session {
        Session(Arc::new(Inner {
            state: Mutex::new(State {
                config,
                tablets: HashMap::new(),
                pending_lookup: Vec::new(),
            }),
            locator,
            dispatcher,
            consistency,
            scheduler: Scheduler::new(),
            next_op_id: AtomicU64::new(1),
        }))
    }

    /// Submits a single row mutation. Never blocks on network I/O.
    ///
    /// Returns `Ok(fut)` with the operation's completion future. Returns
    /// `Err(Throttled)` when buffering this operation required flushing the
    /// tablet's previous batch while an even earlier one was still in flight:
    /// `Throttled::op` is still this operation's ordinary completion future — it
    /// was buffered successfully — `Throttled::until` is the future the caller
    /// should await before issuing more writes against that tablet.
    pub fn apply(
        &self,
        table: impl Into<TableId>,
        row_key: impl Into<RowKey>,
        payload: Vec<u8>,
    ) -> Result<OperationFuture, Throttled> {
        let (timeout, consistency_mode, max_attempts, flush_mode) = {
            let state = self.0.state.lock();
            (
                state.config.timeout,
                state.config.consistency_mode,
                state.config.max_attempts,
                state.config.flush_mode,
            )
        };

        let id = self.0.next_op_id.fetch_add(1, Ordering::Relaxed);
        let (mut op, fut) = Operation::new(id, table.into(), row_key.into(), payload, max_attempts);
        op.timeout = timeout;
        op.consistency_mode = consistency_mode;

        if op.attempts_exhausted() {
            op.fail(OperationError::RetryExhausted);
            return Ok(fut);
        }

        match flush_mode {
            FlushMode::Sync => {
                let _ = self.dispatch_solo(op);
                Ok(fut)
            }
            FlushMode::Background | FlushMode::Manual => match self.route(op) {
                Some(until) => Err(Throttled { op: fut, until }),
                None => Ok(fut),
            },
        }
    }

    /// Resolves `op`'s tablet from the locator's cache and either buffers it or
    /// enqueues it for lookup.
    fn route(&self, mut op: Operation) -> Option<SharedBatchFuture> {
        match self.0.locator.cached_tablet(&op.table, &op.row_key) {
            Some(tablet) => {
                op.bind_tablet(tablet.clone());
                self.add_to_buffer(tablet, op)
            }
            None => {
                self.enqueue_lookup(op);
                None
            }
        }
    }

    /// Dispatches a single operation directly, bypassing batching. Used for SYNC-mode
    /// `apply` calls and for lookup-pending operations rescued by `flush()` — both are
    /// "one op, one RPC, no batch" dispatches. Returns a handle the caller can await
    /// to know the dispatch has actually completed.
    fn dispatch_solo(&self, op: Operation) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.0.dispatcher.clone();
        let tracker = self.0.consistency.clone();
        tokio::spawn(async move {
            let result = dispatcher.send_operation(&op).await;
            complete_ops(vec![op], result, tracker.as_ref());
        })
    }

    /// Buffers `op` into `tablet`'s accumulating batch, flushing the existing one
    /// first if it would overflow.
    fn add_to_buffer(&self, tablet: TabletId, mut op: Operation) -> Option<SharedBatchFuture> {
        let mut state = self.0.state.lock();
        let buffer_limit = state.config.buffer_size_limit;
        let flush_mode = state.config.flush_mode;
        let interval = state.config.flush_interval;
        let consistency_mode = state.config.consistency_mode;
        let table = op.table.clone();

        let overflow = state
            .tablets
            .get(&tablet)
            .and_then(|ts| ts.accumulating.as_ref())
            .map(|(b, _)| b.len() + 1 > buffer_limit)
            .unwrap_or(false);

        if overflow {
            if flush_mode == FlushMode::Manual {
                drop(state);
                op.fail(OperationError::BufferFull);
                return None;
            }

            let expected_id = state
                .tablets
                .get(&tablet)
                .and_then(|ts| ts.accumulating.as_ref())
                .map(|(b, _)| b.id)
                .expect("overflow implies an accumulating batch");
            self.flush_tablet_locked(&mut state, &tablet, expected_id);

            // If the accumulating slot is still occupied, the flush above was
            // deferred (the tablet's prior batch is still in flight) rather than
            // dispatched: the batch that just overflowed is left untouched and
            // will flush on its own once that prior batch clears. Park `op` to
            // retry then, instead of forcing it into a batch already at its limit.
            let still_blocked = state
                .tablets
                .get(&tablet)
                .map(|ts| ts.accumulating.is_some())
                .unwrap_or(false);
            if still_blocked {
                let until = state.tablets.get(&tablet).and_then(|ts| ts.in_flight.clone());
                drop(state);
                return self.park_for_retry(tablet, op, until);
            }
        }

        let ts = state.tablets.entry(tablet.clone()).or_default();
        if ts.accumulating.is_none() {
            let (batch, batch_fut) = Batch::new(table, tablet.clone(), consistency_mode);
            ts.accumulating = Some((batch, batch_fut));
            if matches!(flush_mode, FlushMode::Background) {
                let batch_id = ts.accumulating.as_ref().unwrap().0.id;
                let session = self.clone();
                let t = tablet.clone();
                self.0
                    .scheduler
                    .after(interval, async move { session.flush_tablet(&t, batch_id) }.map(|_| ()));
            }
        }
        ts.accumulating.as_mut().unwrap().0.push(op);

        None
    }

    /// Retries buffering `op` once `until` (the tablet's current in-flight batch)
    /// completes, rather than appending it to a batch that has already reached its
    /// size limit. Returns `until` itself as the throttle signal for the immediate
    /// caller to await.
    fn park_for_retry(
        &self,
        tablet: TabletId,
        op: Operation,
        until: Option<SharedBatchFuture>,
    ) -> Option<SharedBatchFuture> {
        match until {
            Some(until) => {
                let session = self.clone();
                let wait_for = until.clone();
                tokio::spawn(async move {
                    let _ = wait_for.await;
                    let _ = session.add_to_buffer(tablet, op);
                });
                Some(until)
            }
            // Defensive: the in-flight batch vanished between the check above and
            // here, so nothing blocks a fresh attempt.
            None => self.add_to_buffer(tablet, op),
        }
    }

    /// Parks `op` in `pending_lookup` and arranges for the lookup (or "wait for
    /// table creation") to retry it once resolved.
    fn enqueue_lookup(&self, mut op: Operation) {
        op.attempt += 1;
        let id = op.id;
        let table = op.table.clone();
        let row_key = op.row_key.clone();
        let table_not_served = self.0.locator.is_table_not_served(&table);

        self.0.state.lock().pending_lookup.push(op);

        let session = self.clone();
        let locator = self.0.locator.clone();
        if table_not_served {
            tokio::spawn(async move {
                let result = locator.wait_for_table_creation(&table).await;
                session.on_table_created(id, result);
            });
        } else {
            tokio::spawn(async move {
                let result = locator.locate(&table, &row_key).await;
                session.on_located(id, result).await;
            });
        }
    }

    /// Removes `id` from `pending_lookup` if still present. Returning `None` means
    /// the operation was already rescued by a concurrent `flush()` — the caller
    /// must treat that as a no-op.
    fn take_pending(&self, id: u64) -> Option<Operation> {
        let mut state = self.0.state.lock();
        let pos = state.pending_lookup.iter().position(|op| op.id == id)?;
        Some(state.pending_lookup.remove(pos))
    }

    fn on_table_created(&self, id: u64, result: Result<(), LocatorError>) {
        let Some(op) = self.take_pending(id) else {
            return;
        };
        if let Err(err) = result {
            tracing::warn!(op_id = id, error = %err, "wait_for_table_creation failed, retrying anyway");
        }
        self.retry(op);
    }

    async fn on_located(&self, id: u64, result: Result<LocateResult, LocatorError>) {
        let Some(op) = self.take_pending(id) else {
            return;
        };
        match result {
            Ok(LocateResult::Tablet(tablet)) => self.buffer_resolved(tablet, op),
            Ok(recoverable @ LocateResult::Recoverable(_)) => {
                let recovery = self.0.locator.classify_lookup_failure(&op, &recoverable).await;
                match recovery {
                    Some(wait_for) => {
                        let session = self.clone();
                        tokio::spawn(async move {
                            let _ = wait_for.await;
                            session.retry(op);
                        });
                    }
                    None => self.retry(op),
                }
            }
            Err(err) => {
                tracing::warn!(op_id = id, error = %err, "tablet lookup failed");
                if op.attempts_exhausted() {
                    op.fail(OperationError::RetryExhausted);
                } else {
                    self.retry(op);
                }
            }
        }
    }

    /// Binds `op` to the tablet a lookup just resolved and buffers it directly,
    /// rather than going through `route`'s cache read a second time: the resolved
    /// tablet is already known here, and nothing requires the locator to have
    /// populated its cache as a side effect of `locate()` by this point.
    fn buffer_resolved(&self, tablet: TabletId, mut op: Operation) {
        if op.attempts_exhausted() {
            op.fail(OperationError::RetryExhausted);
            return;
        }
        op.bind_tablet(tablet.clone());
        let _ = self.add_to_buffer(tablet, op);
    }

    /// Retries a parked operation by re-entering the routing path. Unlike the
    /// top-level `apply`, nothing here is waiting on a throttle signal: by the time
    /// `route` returns, `op` has already been durably placed (buffered into a
    /// batch, or parked back in `pending_lookup`), so a throttle signal is simply
    /// dropped rather than chased further.
    fn retry(&self, op: Operation) {
        if op.attempts_exhausted() {
            op.fail(OperationError::RetryExhausted);
            return;
        }
        let _ = self.route(op);
    }

    /// Flushes `tablet`'s accumulating batch if it still matches `expected_batch_id`
    /// (it may already have been flushed by a size trigger). Synchronous: any
    /// actual dispatch is handed off to a spawned task, never awaited here.
    fn flush_tablet(&self, tablet: &TabletId, expected_batch_id: u64) -> SharedBatchFuture {
        let mut state = self.0.state.lock();
        self.flush_tablet_locked(&mut state, tablet, expected_batch_id)
    }

    fn flush_tablet_locked(
        &self,
        state: &mut State,
        tablet: &TabletId,
        expected_batch_id: u64,
    ) -> SharedBatchFuture {
        let still_current = state
            .tablets
            .get(tablet)
            .and_then(|ts| ts.accumulating.as_ref())
            .map(|(b, _)| b.id == expected_batch_id)
            .unwrap_or(false);

        if !still_current {
            // Already flushed by an earlier caller (e.g. a size-triggered flush
            // that beat a timer to it): nothing to do.
            return already_done();
        }

        if let Some(in_flight) = state.tablets.get(tablet).and_then(|ts| ts.in_flight.clone()) {
            // A previous batch for this tablet is still on the wire. Defer rather
            // than drop: wait for it to finish, then try again.
            //
            // Spawned eagerly rather than returned as a bare lazy future: nothing
            // else in this module polls the handle this function returns on the
            // deferred path (`add_to_buffer`'s overflow branch only inspects it
            // for the throttle signal; timer-driven callers discard it outright).
            // A `Shared` future nobody ever polls never makes progress, so the
            // retry itself is driven by this spawn; the bridging oneshot below
            // just gives observers something to await without being the only
            // thing driving it forward.
            let session = self.clone();
            let tablet = tablet.clone();
            let (tx, rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                let _ = in_flight.await;
                let result = session.flush_tablet(&tablet, expected_batch_id).await;
                let _ = tx.send(result);
            });
            return async move {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Arc::new(Err(OperationError::TransportError(
                        "deferred flush was dropped before completing".into(),
                    ))),
                }
            }
            .boxed()
            .shared();
        }

        // Move the batch out of `accumulating` and into `in_flight`, then dispatch it.
        let (mut batch, batch_fut) = state
            .tablets
            .get_mut(tablet)
            .and_then(|ts| ts.accumulating.take())
            .expect("still_current implies an accumulating batch");

        state.tablets.entry(tablet.clone()).or_default().in_flight = Some(batch_fut.clone());
        batch.set_deadline(state.config.timeout);

        let dispatcher = self.0.dispatcher.clone();
        let tracker = self.0.consistency.clone();
        let session = self.clone();
        let tablet = tablet.clone();
        tokio::spawn(async move {
            let result = dispatcher.send_batch(&batch).await;
            if let Err(err) = &result {
                tracing::warn!(tablet = %tablet, error = %err, "batch dispatch failed");
            }
            batch.complete(result, tracker.as_ref());
            let mut state = session.0.state.lock();
            if let Some(ts) = state.tablets.get_mut(&tablet) {
                ts.in_flight = None;
            }
        });

        batch_fut
    }

    /// Drains `pending_lookup` and snapshots `accumulating`, dispatching both
    /// outside the lock, and waits for everything collected to finish before
    /// returning — including lookup-pending operations dispatched solo, not just
    /// the batches.
    pub async fn flush(&self) {
        let (stranded, snapshot) = {
            let mut state = self.0.state.lock();
            let stranded = std::mem::take(&mut state.pending_lookup);
            let snapshot: Vec<(TabletId, u64)> = state
                .tablets
                .iter()
                .filter_map(|(tablet, ts)| ts.accumulating.as_ref().map(|(b, _)| (tablet.clone(), b.id)))
                .collect();
            (stranded, snapshot)
        };

        let mut pending = Vec::with_capacity(stranded.len() + snapshot.len());
        for op in stranded {
            let handle = self.dispatch_solo(op);
            pending.push(async move { let _ = handle.await; }.boxed());
        }
        for (tablet, batch_id) in snapshot {
            let fut = self.flush_tablet(&tablet, batch_id);
            pending.push(async move { let _ = fut.await; }.boxed());
        }
        join_all(pending).await;
    }

    /// Stops the scheduler (no further timer-driven flushes) then flushes
    /// everything outstanding. Calling `apply` afterward is undefined.
    pub async fn close(&self) {
        self.0.scheduler.stop();
        self.flush().await;
    }

    /// `true` unless `accumulating`, `in_flight` and `pending_lookup` are all empty.
    pub fn has_pending_operations(&self) -> bool {
        !self.0.state.lock().is_empty()
    }

    /// Changes the flush mode. Fails unless the session is completely empty — an
    /// in-progress batch or pending lookup under one flush policy isn't safe to
    /// reinterpret under another mid-flight.
    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<(), ConfigError> {
        self.mutate_if_empty(|config| config.flush_mode = mode)
    }

    pub fn set_consistency_mode(
        &self,
        mode: crate::consistency::ConsistencyMode,
    ) -> Result<(), ConfigError> {
        self.mutate_if_empty(|config| config.consistency_mode = mode)
    }

    pub fn set_buffer_size_limit(&self, limit: usize) -> Result<(), ConfigError> {
        self.mutate_if_empty(|config| config.buffer_size_limit = limit)
    }

    /// Timeout may change at any time; it only affects ops/batches dispatched
    /// afterward.
    pub fn set_timeout(&self, timeout: Option<std::time::Duration>) {
        self.0.state.lock().config.timeout = timeout;
    }

    /// Flush interval may change at any time; it only affects batches that start
    /// accumulating afterward.
    pub fn set_flush_interval(&self, interval: std::time::Duration) {
        self.0.state.lock().config.flush_interval = interval;
    }

    pub fn set_priority(&self, priority: crate::config::Priority) {
        self.0.state.lock().config.priority = priority;
    }

    fn mutate_if_empty(&self, f: impl FnOnce(&mut SessionConfig)) -> Result<(), ConfigError> {
        let mut state = self.0.state.lock();
        if !state.is_empty() {
            return Err(ConfigError::NotEmpty);
        }
        f(&mut state.config);
        Ok(())
    }

    /// Test/debug helper: exposes just enough of the internal state to assert
    /// buffering invariants without reaching into private fields.
    pub fn debug_snapshot(&self) -> SessionSnapshot {
        let state = self.0.state.lock();
        SessionSnapshot {
            accumulating_tablets: state.tablets.values().filter(|ts| ts.accumulating.is_some()).count(),
            in_flight_tablets: state.tablets.values().filter(|ts| ts.in_flight.is_some()).count(),
            pending_lookup: state.pending_lookup.len(),
        }
    }

    /// Test/debug helper: the number of operations currently buffered in
    /// `tablet`'s accumulating batch, if one exists. `debug_snapshot` only exposes
    /// tablet counts, not individual batch sizes.
    pub fn debug_accumulating_len(&self, tablet: &TabletId) -> Option<usize> {
        let state = self.0.state.lock();
        state.tablets.get(tablet).and_then(|ts| ts.accumulating.as_ref()).map(|(b, _)| b.len())
    }
}

/// An immediately-resolved "nothing to flush" future.
fn already_done() -> SharedBatchFuture {
    async move { Arc::new(Ok(WriteResponse::default())) }.boxed().shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::{NullConsistencyTracker, WriteTimestamp};
    use crate::dispatcher::DispatchError;
    use crate::locator::RecoveryFuture;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLocator {
        cached: Mutex<HashMap<TableId, TabletId>>,
        not_served: Mutex<std::collections::HashSet<TableId>>,
    }

    #[async_trait::async_trait]
    impl TabletLocator for FakeLocator {
        fn cached_tablet(&self, table: &TableId, _key: &[u8]) -> Option<TabletId> {
            self.cached.lock().get(table).cloned()
        }

        async fn locate(&self, table: &TableId, _key: &[u8]) -> Result<LocateResult, LocatorError> {
            Ok(LocateResult::Tablet(
                self.cached.lock().get(table).cloned().unwrap_or_else(|| "t0".into()),
            ))
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

    impl FakeLocator {
        fn with_tablet(table: &str, tablet: &str) -> Arc<FakeLocator> {
            let loc = FakeLocator::default();
            loc.cached.lock().insert(table.into(), tablet.into());
            Arc::new(loc)
        }
    }

    struct FakeDispatcher {
        solo_calls: AtomicUsize,
        batch_calls: AtomicUsize,
        per_row_errors: Vec<crate::operation::PerRowError>,
    }

    impl Default for FakeDispatcher {
        fn default() -> Self {
            FakeDispatcher {
                solo_calls: AtomicUsize::new(0),
                batch_calls: AtomicUsize::new(0),
                per_row_errors: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl RpcDispatcher for FakeDispatcher {
        async fn send_operation(&self, _op: &Operation) -> Result<WriteResponse, DispatchError> {
            self.solo_calls.fetch_add(1, Ordering::SeqCst);
            Ok(WriteResponse {
                write_timestamp: Some(WriteTimestamp(1)),
                ..Default::default()
            })
        }

        async fn send_batch(&self, batch: &Batch) -> Result<WriteResponse, DispatchError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            let _ = batch.len();
            Ok(WriteResponse {
                write_timestamp: Some(WriteTimestamp(2)),
                per_row_errors: self.per_row_errors.clone(),
                ..Default::default()
            })
        }
    }

    fn session_with(
        config: SessionConfig,
        locator: Arc<dyn TabletLocator>,
        dispatcher: Arc<FakeDispatcher>,
    ) -> Session {
        Session::new(config, locator, dispatcher, Arc::new(NullConsistencyTracker))
    }

    #[tokio::test]
    async fn sync_mode_never_buffers() {
        let locator = FakeLocator::with_tablet("t", "tablet-1");
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Sync,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher.clone());

        let f1 = session.apply("t", vec![1], vec![]).unwrap();
        let f2 = session.apply("t", vec![2], vec![]).unwrap();
        assert!(f1.await.is_ok());
        assert!(f2.await.is_ok());
        assert_eq!(dispatcher.solo_calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.debug_snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn background_flushes_on_timer() {
        let locator = FakeLocator::with_tablet("t", "tablet-1");
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Background,
            buffer_size_limit: 10,
            flush_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher.clone());

        let mut futs = Vec::new();
        for i in 0..5u8 {
            futs.push(session.apply("t", vec![i], vec![]).unwrap());
        }
        assert_eq!(session.debug_snapshot().accumulating_tablets, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        for f in futs {
            assert!(f.await.is_ok());
        }
        assert_eq!(dispatcher.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.debug_snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn manual_overflow_fails_with_buffer_full() {
        let locator = FakeLocator::with_tablet("t", "tablet-1");
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Manual,
            buffer_size_limit: 3,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher);

        for i in 0..3u8 {
            session.apply("t", vec![i], vec![]).unwrap();
        }
        let f4 = session.apply("t", vec![9], vec![]).unwrap();
        match f4.await {
            Err(OperationError::BufferFull) => {}
            other => panic!("expected BufferFull, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn manual_flush_drains_accumulating_batch() {
        let locator = FakeLocator::with_tablet("t", "tablet-1");
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Manual,
            buffer_size_limit: 10,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher.clone());

        let f1 = session.apply("t", vec![1], vec![]).unwrap();
        let f2 = session.apply("t", vec![2], vec![]).unwrap();
        assert_eq!(session.debug_snapshot().accumulating_tablets, 1);

        session.flush().await;

        assert!(f1.await.is_ok());
        assert!(f2.await.is_ok());
        assert_eq!(dispatcher.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.debug_snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn pending_lookup_rescued_by_flush_becomes_rc_noop() {
        let locator = Arc::new(FakeLocator::default()); // no cached tablet for "t"
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Manual,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher.clone());

        let f = session.apply("t", vec![1], vec![]).unwrap();
        assert_eq!(session.debug_snapshot().pending_lookup, 1);

        session.flush().await;
        assert!(f.await.is_ok());
        assert_eq!(dispatcher.solo_calls.load(Ordering::SeqCst), 1);

        // Give the in-flight `locate()`'s retry continuation a chance to fire; it
        // should find the op already gone from pending_lookup and no-op.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.debug_snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn flush_waits_for_rescued_lookup_to_actually_complete() {
        let locator = Arc::new(FakeLocator::default());
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Manual,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher.clone());

        let f = session.apply("t", vec![1], vec![]).unwrap();
        session.flush().await;

        // flush() must not return before the stranded op's solo dispatch has
        // actually finished, not merely been spawned.
        assert!(f.await.is_ok());
        assert_eq!(dispatcher.solo_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_lookup_buffers_without_recaching() {
        // The locator's cache starts empty; a successful `locate()` must bind the
        // operation to the tablet it resolved rather than relying on a second,
        // unpopulated cache read.
        let locator = Arc::new(FakeLocator::default());
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Manual,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher.clone());

        let f = session.apply("t", vec![1], vec![]).unwrap();
        // Give the spawned `locate()` call a chance to resolve and buffer the op.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.debug_snapshot().accumulating_tablets, 1);
        assert_eq!(session.debug_snapshot().pending_lookup, 0);

        session.flush().await;
        assert!(f.await.is_ok());
        assert_eq!(dispatcher.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_row_errors_reach_only_their_operation() {
        let locator = FakeLocator::with_tablet("t", "tablet-1");
        let mut dispatcher = FakeDispatcher::default();
        dispatcher.per_row_errors = vec![crate::operation::PerRowError {
            row_index: 1,
            detail: "boom".into(),
        }];
        let dispatcher = Arc::new(dispatcher);
        let config = SessionConfig {
            flush_mode: FlushMode::Manual,
            buffer_size_limit: 10,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher);

        let f0 = session.apply("t", vec![0], vec![]).unwrap();
        let f1 = session.apply("t", vec![1], vec![]).unwrap();
        let f2 = session.apply("t", vec![2], vec![]).unwrap();
        session.flush().await;

        assert_eq!(f0.await.unwrap(), None);
        assert!(f1.await.unwrap().is_some());
        assert_eq!(f2.await.unwrap(), None);
    }

    #[tokio::test]
    async fn config_setter_rejected_while_buffering() {
        let locator = FakeLocator::with_tablet("t", "tablet-1");
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Manual,
            buffer_size_limit: 10,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher);

        let _f = session.apply("t", vec![1], vec![]).unwrap();
        assert!(matches!(
            session.set_flush_mode(FlushMode::Background),
            Err(ConfigError::NotEmpty)
        ));

        session.flush().await;
        assert!(session.set_flush_mode(FlushMode::Background).is_ok());
    }

    #[tokio::test]
    async fn retry_budget_exhausted_fails_immediately() {
        let locator = FakeLocator::with_tablet("t", "tablet-1");
        let dispatcher = Arc::new(FakeDispatcher::default());
        let config = SessionConfig {
            flush_mode: FlushMode::Sync,
            max_attempts: 0,
            ..Default::default()
        };
        let session = session_with(config, locator, dispatcher.clone());

        let f = session.apply("t", vec![1], vec![]).unwrap();
        match f.await {
            Err(OperationError::RetryExhausted) => {}
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(dispatcher.solo_calls.load(Ordering::SeqCst), 0);
    }
}

//! A tablet-bound group of `Operation`s dispatched as one RPC: an ordered mutation
//! buffer with its own one-shot completion channel, independent of the completion
//! channel each individual `Operation` carries.

use crate::consistency::{ConsistencyMode, ConsistencyTracker};
use crate::dispatcher::{DispatchError, WriteResponse};
use crate::error::OperationError;
use crate::operation::{Operation, TableId, TabletId};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// What a `Batch`'s own completion future resolves to: the response it was dispatched
/// with, or the error every operation in it was failed with.
pub type BatchResult = Result<WriteResponse, OperationError>;

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

struct BatchCompletion(oneshot::Receiver<Arc<BatchResult>>);

impl Future for BatchCompletion {
    type Output = Arc<BatchResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Arc::new(Err(OperationError::TransportError(
                "batch was dropped before it completed".into(),
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The batch's own completion future. `Shared` because a tablet's in-flight batch
/// future is awaited both by the "remove from in_flight" continuation that dispatched
/// it and by any caller handed it as a throttle signal — genuinely multi-consumer,
/// unlike the one-shot completion each individual `Operation` gets.
///
/// Boxed rather than naming `BatchCompletion` directly: the session sometimes has to
/// hand back a future that isn't backed by any real `Batch` yet — a deferred "wait for
/// the current in-flight batch, then try again" continuation, or an
/// immediately-resolved no-op when the expected batch was already flushed by someone
/// else — so the type can't be tied to one concrete `oneshot` channel.
pub type SharedBatchFuture = Shared<BoxFuture<'static, Arc<BatchResult>>>;

/// A mutable, tablet-bound aggregate of `Operation`s.
///
/// Invariants upheld by the `Session`, not this type: non-empty once installed into
/// `accumulating`; every op resolves to the same tablet; appears in at most one of
/// `accumulating`/`in_flight` at a time.
pub struct Batch {
    pub id: u64,
    pub table: TableId,
    pub tablet: TabletId,
    pub consistency_mode: ConsistencyMode,
    pub deadline: Option<Duration>,
    ops: Vec<Operation>,
    completion: Option<oneshot::Sender<Arc<BatchResult>>>,
}

impl Batch {
    pub(crate) fn new(
        table: TableId,
        tablet: TabletId,
        consistency_mode: ConsistencyMode,
    ) -> (Batch, SharedBatchFuture) {
        let (tx, rx) = oneshot::channel();
        let batch = Batch {
            id: NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed),
            table,
            tablet,
            consistency_mode,
            deadline: None,
            ops: Vec::new(),
            completion: Some(tx),
        };
        (batch, BatchCompletion(rx).boxed().shared())
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Resets the deadline from the current session timeout.
    pub fn set_deadline(&mut self, timeout: Option<Duration>) {
        self.deadline = timeout;
    }

    /// Applies the dispatch response to every op the batch held and resolves the
    /// batch's own future. Consumes the batch: every op it held is handed its terminal
    /// outcome.
    pub(crate) fn complete(
        mut self,
        response: Result<WriteResponse, DispatchError>,
        tracker: &dyn ConsistencyTracker,
    ) -> BatchResult {
        let ops = std::mem::take(&mut self.ops);
        let result = complete_ops(ops, response, tracker);
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Arc::new(result.clone()));
        }
        result
    }
}

/// Shared by `Batch::complete` and the `Session`'s solo dispatch path (an operation
/// sent on its own, never joining `accumulating`/`in_flight`): applies a dispatcher
/// response to a set of operations.
///
/// Per-row errors are matched positionally: the cursor into `per_row_errors` only
/// advances on a match against the current op's index, never unconditionally, so a
/// response with fewer per-row errors than ops still lines each one up correctly.
pub(crate) fn complete_ops(
    ops: Vec<Operation>,
    response: Result<WriteResponse, DispatchError>,
    tracker: &dyn ConsistencyTracker,
) -> BatchResult {
    let response = match response {
        Ok(r) => r,
        Err(DispatchError::Transport(msg)) => {
            let err = OperationError::TransportError(msg);
            fail_all(ops, err.clone());
            return Err(err);
        }
        Err(DispatchError::InvalidResponse(msg)) => {
            let err = OperationError::InvalidResponse(msg);
            fail_all(ops, err.clone());
            return Err(err);
        }
    };

    if let Some(top) = &response.error {
        let err = OperationError::ServerError {
            code: top.code,
            message: top.message.clone(),
        };
        fail_all(ops, err.clone());
        return Err(err);
    }

    if let Some(ts) = response.write_timestamp {
        tracker.update_last_propagated_timestamp(ts);
    }

    let mut errors_index = 0;
    for (i, op) in ops.into_iter().enumerate() {
        let per_row = if errors_index < response.per_row_errors.len()
            && response.per_row_errors[errors_index].row_index == i
        {
            let e = response.per_row_errors[errors_index].clone();
            errors_index += 1;
            Some(e)
        } else {
            None
        };
        op.complete(Ok(per_row));
    }

    Ok(response)
}

fn fail_all(ops: Vec<Operation>, err: OperationError) {
    for op in ops {
        op.fail(err.clone());
    }
}

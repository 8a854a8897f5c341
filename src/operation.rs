//! A single row mutation and the one-shot channel that delivers its terminal outcome.

use crate::consistency::ConsistencyMode;
use crate::error::OperationError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

pub type TableId = String;
pub type TabletId = String;
pub type RowKey = Vec<u8>;

/// A single row's error within an otherwise-successful batch response, positionally
/// ordered by `row_index` ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerRowError {
    pub row_index: usize,
    pub detail: String,
}

/// What an individual `Operation` resolves to: `Ok(None)` on a clean write, `Ok(Some(_))`
/// when the server reported a per-row error for this op specifically, `Err(_)` for
/// anything that kept the operation from ever reaching (or completing at) the server.
pub type ApplyOutcome = Result<Option<PerRowError>, OperationError>;

/// A buffered (or about-to-be-dispatched) row mutation.
///
/// At any instant an `Operation` is in at most one of: `pending_lookup`, some tablet's
/// `accumulating` batch, some tablet's `in_flight` batch, or a solo dispatch — the
/// session, not this type, enforces that by construction.
#[derive(Debug)]
pub struct Operation {
    pub id: u64,
    pub table: TableId,
    pub row_key: RowKey,
    pub payload: Vec<u8>,
    pub timeout: Option<Duration>,
    pub consistency_mode: ConsistencyMode,
    /// Number of lookup/dispatch attempts made so far, including the current one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub tablet: Option<TabletId>,
    completion: Option<oneshot::Sender<ApplyOutcome>>,
}

impl Operation {
    pub(crate) fn new(
        id: u64,
        table: TableId,
        row_key: RowKey,
        payload: Vec<u8>,
        max_attempts: u32,
    ) -> (Operation, OperationFuture) {
        let (tx, rx) = oneshot::channel();
        let op = Operation {
            id,
            table,
            row_key,
            payload,
            timeout: None,
            consistency_mode: ConsistencyMode::default(),
            attempt: 0,
            max_attempts,
            tablet: None,
            completion: Some(tx),
        };
        (op, OperationFuture(rx))
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn bind_tablet(&mut self, tablet: TabletId) {
        self.tablet = Some(tablet);
    }

    /// Delivers the operation's terminal outcome. A no-op if called twice — only the
    /// first call can still hold the sender.
    pub fn complete(mut self, outcome: ApplyOutcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }

    pub fn fail(self, err: OperationError) {
        self.complete(Err(err));
    }
}

/// The application-visible handle for an `Operation`'s eventual outcome.
pub struct OperationFuture(oneshot::Receiver<ApplyOutcome>);

impl std::fmt::Debug for OperationFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationFuture").finish_non_exhaustive()
    }
}

impl Future for OperationFuture {
    type Output = ApplyOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(OperationError::TransportError(
                "operation was dropped before it completed".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

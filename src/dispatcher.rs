//! The RPC transport boundary, consumed via a trait only: wire encoding and transport
//! itself are out of scope for this crate. An implementation translates its own wire
//! format into the plain `WriteResponse` shape below; this module never sees the wire
//! format directly.

use crate::batch::Batch;
use crate::consistency::WriteTimestamp;
use crate::operation::{Operation, PerRowError};

/// Top-level error carried on an otherwise-well-formed write response.
#[derive(Debug, Clone)]
pub struct TopLevelError {
    pub code: i32,
    pub message: String,
}

/// The shape every `RpcDispatcher` implementation must translate its wire response
/// into.
#[derive(Debug, Clone, Default)]
pub struct WriteResponse {
    pub error: Option<TopLevelError>,
    pub write_timestamp: Option<WriteTimestamp>,
    /// Positionally ordered by `row_index` ascending.
    pub per_row_errors: Vec<PerRowError>,
}

/// Failure returned by a dispatcher call itself, as opposed to a failure reported
/// inside an otherwise-successful `WriteResponse`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Consumed interface: sends a solo `Operation` or a tablet's `Batch` to its owning
/// tablet server. Implementations own the wire encoding and retry policy; this crate
/// only calls `send_operation`/`send_batch` and interprets the result.
#[async_trait::async_trait]
pub trait RpcDispatcher: Send + Sync {
    async fn send_operation(&self, op: &Operation) -> Result<WriteResponse, DispatchError>;
    async fn send_batch(&self, batch: &Batch) -> Result<WriteResponse, DispatchError>;
}

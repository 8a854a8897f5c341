//! # tablet-session
//!
//! A client-side write session for tablet-sharded key-value stores: a context that
//! accepts row-level mutations, buffers them per tablet, and dispatches batches to
//! whichever tablet server owns each shard.
//!
//! This crate owns none of tablet-location resolution, RPC transport, wire encoding,
//! or server-side storage — those are the two collaborator traits, [`locator::TabletLocator`]
//! and [`dispatcher::RpcDispatcher`], that an application supplies.
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use tablet_session::config::SessionConfig;
//! use tablet_session::consistency::NullConsistencyTracker;
//! use tablet_session::session::Session;
//!
//! # async fn run(
//! #     locator: Arc<dyn tablet_session::locator::TabletLocator>,
//! #     dispatcher: Arc<dyn tablet_session::dispatcher::RpcDispatcher>,
//! # ) {
//! let session = Session::new(
//!     SessionConfig::default(),
//!     locator,
//!     dispatcher,
//!     Arc::new(NullConsistencyTracker),
//! );
//!
//! let outcome = session.apply("players", b"row-1".to_vec(), b"payload".to_vec());
//! let fut = outcome.unwrap_or_else(|throttled| throttled.op);
//! let _ = fut.await;
//!
//! session.close().await;
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod consistency;
pub mod dispatcher;
pub mod error;
pub mod locator;
pub mod operation;
pub mod scheduler;
pub mod session;

pub use config::{FlushMode, Priority, SessionConfig};
pub use error::{ConfigError, OperationError, Throttled};
pub use operation::{ApplyOutcome, Operation, OperationFuture, PerRowError, RowKey, TableId, TabletId};
pub use session::Session;

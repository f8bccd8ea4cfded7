//! Transactional delivery of session messages.
//!
//! Application transactions do not write to clients directly. They queue
//! output on a [`TransactionContext`]; the external transaction coordinator
//! drives it through `prepare` and `commit` (or `abort`), and a flush worker
//! delivers committed output through a [`FlushTarget`] strictly in the order
//! contexts were prepared.
//!
//! ```text
//! txn A: send(s, [1,2]) ─ prepare ─────────── commit ─┐
//! txn B: send(s, [3])   ─── prepare ─ commit ─────────┤
//!                                                     ▼
//! flush worker:                       s receives [1,2] then [3]
//! ```
//!
//! Commit never waits for delivery, and nothing an aborted transaction
//! queued is ever delivered.

mod context;
mod error;
mod pipeline;
mod update;

pub use context::TransactionContext;
pub use error::DeliveryError;
pub use pipeline::{DeliveryPipeline, FlushTarget};
pub use update::{OutboundMessage, Update};

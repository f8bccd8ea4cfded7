//! Error types for the delivery pipeline.

/// Errors returned synchronously by [`TransactionContext`](crate::TransactionContext)
/// operations. These are state conflicts; delivery failures after commit are
/// never reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Output was added, or `prepare` repeated, after the context was
    /// prepared.
    #[error("transaction already prepared")]
    AlreadyPrepared,

    /// `commit` was called before `prepare`.
    #[error("transaction not prepared")]
    NotPrepared,

    /// The context was aborted.
    #[error("transaction aborted")]
    Aborted,

    /// `abort` was called on a committed context.
    #[error("transaction already committed")]
    AlreadyCommitted,

    /// The pipeline no longer accepts work.
    #[error("delivery pipeline shut down")]
    ShutDown,
}

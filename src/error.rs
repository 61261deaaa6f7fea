//! Error taxonomy for the offline order queue.
//!
//! Per-order submission failures are deliberately absent: the sync engine
//! absorbs those into the record's `last_error` and the drain summary so a
//! single bad order never fails a whole drain. Only whole-operation failures
//! surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Local persistence failed. An order that cannot even be queued is a
    /// lost sale, so callers must surface this to the operator immediately.
    #[error("local storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A drain was requested with no connectivity. Advisory: no record was
    /// mutated and the queue is left intact.
    #[error("order server unreachable; queue left untouched")]
    Offline,

    /// A status update targeted a record that no longer exists, e.g. the
    /// store was cleared between read and write.
    #[error("queued order {0} not found")]
    NotFound(String),

    /// Order payload rejected before it entered the queue.
    #[error("invalid order payload: {0}")]
    InvalidOrder(String),
}

/// Map any storage-layer error (connection lock, SQL, serialization) into
/// `StorageUnavailable`.
pub(crate) fn storage_err<E: std::fmt::Display>(e: E) -> QueueError {
    QueueError::StorageUnavailable(e.to_string())
}

//! Error taxonomy for ReliableStore.
//!
//! One variant per failure mode the coordinator or an adapter can
//! report. `thiserror` gives us `Display`/`Error`
//! impls; `is_retryable` implements the default retryable predicate
//! (timeouts and cancellation-during-delay are retryable, deterministic
//! prepare/commit conflicts deliberately are not, to avoid retry storms
//! against a conflict that will never resolve).

use crate::ids::{ResourceId, TransactionId};
use crate::state::TransactionState;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for ReliableStore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transaction coordinator and repository adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation was attempted while the transaction was in a state
    /// that does not permit it (e.g. commit twice, enlist after commit).
    #[error("transaction {transaction_id} is {state}, expected Active")]
    InvalidState {
        transaction_id: TransactionId,
        state: TransactionState,
    },

    /// One or more resources voted not-ready or threw during Phase 1.
    #[error("prepare failed for transaction {transaction_id}: {cause}")]
    PrepareFailed {
        transaction_id: TransactionId,
        cause: Box<Error>,
        suppressed: Vec<Error>,
    },

    /// One or more resources threw during Phase 2. Backend state may be
    /// partially applied; recovery is the caller's concern.
    #[error("commit failed for transaction {transaction_id}: {cause}")]
    CommitFailed {
        transaction_id: TransactionId,
        cause: Box<Error>,
        suppressed: Vec<Error>,
    },

    /// At least one resource's rollback threw. Logged and aggregated,
    /// but never masks whatever primary cause triggered the rollback.
    #[error("rollback failed for transaction {transaction_id} on {} resource(s)", causes.len())]
    RollbackFailed {
        transaction_id: TransactionId,
        causes: Vec<(ResourceId, Error)>,
    },

    /// The per-transaction timer fired before the transaction reached
    /// `Prepared`; an asynchronous rollback has been scheduled.
    #[error("transaction {transaction_id} timed out after {elapsed:?}")]
    Timeout {
        transaction_id: TransactionId,
        elapsed: Duration,
    },

    /// The caller's cancellation token fired before the operation
    /// completed.
    #[error("operation on transaction {transaction_id} was cancelled")]
    Cancelled { transaction_id: TransactionId },

    /// `RollbackToSavepoint` named a savepoint not registered on this
    /// transaction's coordinator registry.
    #[error("savepoint `{name}` not found on transaction {transaction_id}")]
    SavepointMissing {
        transaction_id: TransactionId,
        name: String,
    },

    /// `CreateSavepoint` named a savepoint that already exists on this
    /// transaction.
    #[error("savepoint `{name}` already exists on transaction {transaction_id}")]
    SavepointConflict {
        transaction_id: TransactionId,
        name: String,
    },

    /// The savepoint passed to `RollbackToSavepoint` belongs to a
    /// different transaction than the one it was invoked on.
    #[error(
        "savepoint belongs to transaction {savepoint_transaction_id}, not {transaction_id}"
    )]
    WrongTransactionSavepoint {
        transaction_id: TransactionId,
        savepoint_transaction_id: TransactionId,
    },

    /// A repository adapter factory was asked to wrap a backend outside
    /// any ambient transaction scope.
    #[error("no ambient transaction is active in this scope")]
    NoAmbientTransaction,

    /// `EnlistResource` was called with a `resource_id` already
    /// enlisted in this transaction.
    #[error("resource `{resource_id}` is already enlisted in transaction {transaction_id}")]
    DuplicateEnlistment {
        transaction_id: TransactionId,
        resource_id: ResourceId,
    },

    /// Prepare-time optimistic validation found that a value read or
    /// written earlier in the transaction no longer matches the
    /// backend's current value.
    #[error("optimistic validation failed for resource `{resource_id}`, key `{key}`")]
    ValidationConflict { resource_id: ResourceId, key: String },

    /// A wrapped error surfaced by the underlying `Repository<T>`
    /// backend (I/O, serialization, driver errors, ...).
    #[error("backend error in resource `{resource_id}`: {message}")]
    Backend {
        resource_id: ResourceId,
        message: String,
    },
}

impl Error {
    /// Default retry predicate: timeouts and
    /// cancellation are retryable; `PrepareFailed`/`CommitFailed` are
    /// deterministic conflicts and are not retried by default, except
    /// when the wrapped cause is itself retryable (e.g. a resource's
    /// prepare timed out internally).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Cancelled { .. } => true,
            Error::PrepareFailed { cause, .. } | Error::CommitFailed { cause, .. } => {
                cause.is_retryable()
            }
            _ => false,
        }
    }

    /// The transaction id this error pertains to, when applicable.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Error::InvalidState { transaction_id, .. }
            | Error::PrepareFailed { transaction_id, .. }
            | Error::CommitFailed { transaction_id, .. }
            | Error::RollbackFailed { transaction_id, .. }
            | Error::Timeout { transaction_id, .. }
            | Error::Cancelled { transaction_id }
            | Error::SavepointMissing { transaction_id, .. }
            | Error::SavepointConflict { transaction_id, .. }
            | Error::WrongTransactionSavepoint { transaction_id, .. }
            | Error::DuplicateEnlistment { transaction_id, .. } => Some(*transaction_id),
            Error::NoAmbientTransaction
            | Error::ValidationConflict { .. }
            | Error::Backend { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_cancelled_are_retryable() {
        let tx = TransactionId::new();
        assert!(Error::Timeout {
            transaction_id: tx,
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(Error::Cancelled { transaction_id: tx }.is_retryable());
    }

    #[test]
    fn prepare_and_commit_failed_are_not_retryable_by_default() {
        let tx = TransactionId::new();
        let err = Error::PrepareFailed {
            transaction_id: tx,
            cause: Box::new(Error::ValidationConflict {
                resource_id: "orders".into(),
                key: "k1".into(),
            }),
            suppressed: vec![],
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn prepare_failed_wrapping_a_timeout_is_retryable() {
        let tx = TransactionId::new();
        let err = Error::PrepareFailed {
            transaction_id: tx,
            cause: Box::new(Error::Timeout {
                transaction_id: tx,
                elapsed: Duration::from_millis(5),
            }),
            suppressed: vec![],
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn display_includes_transaction_id() {
        let tx = TransactionId::new();
        let err = Error::SavepointMissing {
            transaction_id: tx,
            name: "sp1".into(),
        };
        assert!(err.to_string().contains("sp1"));
        assert!(err.to_string().contains(&tx.to_string()));
    }
}

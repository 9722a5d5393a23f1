//! The contract every 2PC participant honors.

use crate::cancellation::CancellationToken;
use crate::error::Result;
use crate::ids::{ResourceId, TransactionId};
use crate::savepoint::Savepoint;
use async_trait::async_trait;

/// A participant enlisted in a transaction's two-phase commit.
///
/// Implementations are not required to share a base class or even a
/// common backend shape — the coordinator dispatches purely through
/// this trait, so a repository adapter, a file-backed resource, and a
/// SQL-transaction wrapper can all be enlisted in the same transaction.
#[async_trait]
pub trait TransactionalResource: Send + Sync {
    /// Stable identifier, unique within the lifetime of this instance.
    fn resource_id(&self) -> &ResourceId;

    /// Phase 1: validate every staged operation for `transaction_id`
    /// against current backend state. Returning `Ok(false)` (not ready)
    /// is non-exceptional and always triggers rollback of the whole
    /// transaction; returning `Err` has the same effect but also
    /// surfaces the underlying cause.
    async fn prepare(
        &self,
        transaction_id: TransactionId,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Phase 2: apply staged operations to the backend in ascending
    /// timestamp order. May leave the backend partially updated if it
    /// fails partway through — the coordinator treats that as `Failed`.
    async fn commit(&self, transaction_id: TransactionId, cancel: &CancellationToken) -> Result<()>;

    /// Discard all in-memory staged operations and savepoint snapshots
    /// tied to `transaction_id`. Must not fail except on programmer
    /// error (a failure here is still reported, but it no longer blocks
    /// other resources from rolling back).
    async fn rollback(
        &self,
        transaction_id: TransactionId,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Snapshot this resource's staged-op set for `transaction_id`,
    /// keyed by `(transaction_id, savepoint.name())`.
    async fn create_savepoint(
        &self,
        transaction_id: TransactionId,
        savepoint: &Savepoint,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Replace the current staged-op set for `transaction_id` with the
    /// snapshot taken at `savepoint`. A missing snapshot (the resource
    /// was enlisted after the savepoint was created) is a no-op here —
    /// only the coordinator's registry is the authority on whether the
    /// savepoint itself exists.
    async fn rollback_to_savepoint(
        &self,
        transaction_id: TransactionId,
        savepoint: &Savepoint,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Remove the stored snapshot for `(transaction_id,
    /// savepoint.name())`. A missing snapshot is not an error.
    async fn discard_savepoint_data(
        &self,
        transaction_id: TransactionId,
        savepoint: &Savepoint,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

//! The ambient (flow-local) current-transaction slot.
//!
//! Realized with [`tokio::task_local!`]: storage that survives `.await`
//! suspension within a single logical task and does not leak across
//! concurrently-polled sibling tasks. Only the scope helpers in
//! [`crate::factory`] are allowed to set it; this module exposes no
//! public setter.

use crate::Transaction;

tokio::task_local! {
    static CURRENT: Transaction;
}

/// The transaction currently in scope for this task, if any.
///
/// Returns `None` outside of [`crate::factory::execute_in_transaction`]
/// (or an equivalent scope helper). Never reads thread-local storage —
/// `tokio::task_local!` is per-task, so concurrent tasks never observe
/// each other's ambient transaction.
pub fn current() -> Option<Transaction> {
    CURRENT.try_with(|tx| tx.clone()).ok()
}

/// Run `fut` with `tx` installed as the ambient transaction for its
/// duration, restoring whatever was there before (nothing, since
/// `task_local` scopes nest per-future rather than mutate a cell) once
/// `fut` resolves.
pub(crate) async fn scope<F, R>(tx: Transaction, fut: F) -> R
where
    F: std::future::Future<Output = R>,
{
    CURRENT.scope(tx, fut).await
}

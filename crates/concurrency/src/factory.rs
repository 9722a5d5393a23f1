//! Factory and scope helpers: the ergonomic entry points most callers
//! use instead of constructing a `Transaction` directly.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reliablestore_core::{CancellationToken, Error, Result, TransactionOptions, TransactionState};
use tracing::{info, warn};

use crate::ambient;
use crate::coordinator::Transaction;

/// Process-wide transaction counters, incremented as transactions are
/// created and as they reach a terminal state.
#[derive(Debug, Default)]
pub struct Metrics {
    active: AtomicU64,
    started: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rolled_back: AtomicU64,
}

impl Metrics {
    /// Currently active (non-terminal) transactions.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
    /// Total transactions ever created.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
    /// Total transactions that reached `Committed`.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }
    /// Total transactions that reached `Failed`.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
    /// Total transactions whose terminal rollback was triggered by the
    /// timeout timer, rather than by `rollback()` or a prepare/commit
    /// failure. Orthogonal to `failed`/`rolled_back`: a timed-out
    /// transaction is counted here *and* under whichever of those two
    /// its triggered rollback actually landed on.
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }
    /// Total transactions that reached `RolledBack`.
    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }

    fn record_terminal(&self, state: TransactionState, timed_out: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        match state {
            TransactionState::Committed => {
                self.committed.fetch_add(1, Ordering::Relaxed);
            }
            TransactionState::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            TransactionState::RolledBack => {
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }
}

static METRICS: Metrics = Metrics {
    active: AtomicU64::new(0),
    started: AtomicU64::new(0),
    committed: AtomicU64::new(0),
    failed: AtomicU64::new(0),
    timed_out: AtomicU64::new(0),
    rolled_back: AtomicU64::new(0),
};

/// Process-wide transaction metrics, incremented by every transaction
/// created via [`create_transaction`].
pub fn metrics() -> &'static Metrics {
    &METRICS
}

/// Build an `Active` transaction with the given options. Arms the
/// timeout timer and registers a completion callback that updates
/// [`metrics`].
pub fn create_transaction(options: TransactionOptions) -> Transaction {
    let tx = Transaction::new(options);
    METRICS.started.fetch_add(1, Ordering::Relaxed);
    METRICS.active.fetch_add(1, Ordering::Relaxed);
    // Weak: the completion callback lives inside `Inner`, so closing
    // over a strong `Transaction` here would keep `Inner` alive forever
    // through its own callback list.
    let weak = tx.downgrade();
    tx.add_completion_callback(move |state| {
        let timed_out = weak.upgrade().map(|t| t.timed_out()).unwrap_or(false);
        METRICS.record_terminal(state, timed_out);
    });
    tx
}

/// The transaction currently in scope for this task, if any (delegates
/// to [`crate::ambient`]).
pub fn current() -> Option<Transaction> {
    ambient::current()
}

/// Enlist `resource` into the ambient transaction. A backend's
/// transactional adapter consults this slot only when its factory is
/// asked to wrap a repository; it fails loudly if no ambient
/// transaction exists. Returns the ambient transaction on success so
/// the caller can immediately issue operations against it.
pub fn enlist_in_current(
    resource: std::sync::Arc<dyn reliablestore_core::TransactionalResource>,
) -> Result<Transaction> {
    let tx = ambient::current().ok_or(Error::NoAmbientTransaction)?;
    tx.enlist_resource(resource)?;
    Ok(tx)
}

/// Run `action` with a fresh transaction installed as ambient for its
/// duration.
///
/// On success, commits; on any error from `action`, rolls back. If
/// rollback itself fails, both errors are preserved: the rollback
/// failure is returned, carrying the original error as its suppressed
/// cause, so neither is silently dropped. `cancel` is passed through to
/// both `commit` and `rollback`.
pub async fn execute_in_transaction<F, Fut, T>(
    options: TransactionOptions,
    action: F,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tx = create_transaction(options);
    let result = ambient::scope(tx.clone(), action(tx.clone())).await;

    let outcome = match result {
        Ok(value) => match tx.commit(cancel).await {
            Ok(()) => Ok(value),
            Err(commit_err) => Err(commit_err),
        },
        Err(action_err) => match tx.rollback(cancel).await {
            Ok(()) => Err(action_err),
            Err(rollback_err) => {
                // Preserve both: the action's original error as the
                // first cause, the rollback failure(s) appended after.
                let mut causes = vec![(
                    reliablestore_core::ResourceId::new("action"),
                    action_err,
                )];
                match rollback_err {
                    Error::RollbackFailed { causes: more, .. } => causes.extend(more),
                    other => causes.push((reliablestore_core::ResourceId::new("rollback"), other)),
                }
                Err(Error::RollbackFailed {
                    transaction_id: tx.id(),
                    causes,
                })
            }
        },
    };
    tx.close().await;
    outcome
}

/// Default retry predicate: timeouts and cancellation are retryable;
/// deterministic conflicts are not, matching [`Error::is_retryable`].
pub fn default_retry_predicate(err: &Error) -> bool {
    err.is_retryable()
}

/// Wrap [`execute_in_transaction`] in a retry loop with exponential
/// backoff.
///
/// Sleeps `base_delay * 2^(attempt-1)` between attempts. `cancel`
/// firing during a backoff sleep aborts the retry loop immediately and
/// is never itself retried; it is also passed through to every attempt's
/// `execute_in_transaction` call.
pub async fn execute_with_retry<F, Fut, T>(
    action: F,
    max_retries: u32,
    base_delay: Duration,
    options: TransactionOptions,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Fn(Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = execute_in_transaction(options.clone(), &action, cancel).await;
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = default_retry_predicate(&err);
                if !retryable || attempt > max_retries {
                    return Err(err);
                }
                let delay = base_delay * 2u32.pow(attempt - 1);
                warn!(attempt, delay_ms = %delay.as_millis(), error = %err, "retrying transaction after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled {
                            transaction_id: err.transaction_id().unwrap_or_default(),
                        });
                    }
                }
            }
        }
    }
}

/// RAII handle returned by [`create_savepoint_scope`].
///
/// On `release()` the savepoint is simply left in place (no rollback).
/// If the scope is dropped without `release()`/`rollback()` having been
/// called, `Drop` warns and spawns a detached best-effort rollback to
/// the savepoint — the same documented hazard as `Transaction::drop`
/// since `Drop` cannot `.await`.
pub struct SavepointScope {
    tx: Transaction,
    savepoint: reliablestore_core::Savepoint,
    cancel: CancellationToken,
    resolved: bool,
}

impl SavepointScope {
    /// Commit-equivalent: release the savepoint without rolling back.
    pub fn release(mut self) {
        self.resolved = true;
        info!(transaction_id = %self.tx.id(), savepoint = %self.savepoint.name(), "savepoint scope released");
    }

    /// Explicitly roll back to the savepoint this scope was created at.
    pub async fn rollback(mut self) -> Result<()> {
        self.resolved = true;
        self.tx.rollback_to_savepoint(&self.savepoint, &self.cancel).await
    }
}

impl Drop for SavepointScope {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        warn!(
            transaction_id = %self.tx.id(),
            savepoint = %self.savepoint.name(),
            "savepoint scope dropped without release/rollback; scheduling best-effort async rollback"
        );
        let tx = self.tx.clone();
        let savepoint = self.savepoint.clone();
        tokio::spawn(async move {
            let _ = tx.rollback_to_savepoint(&savepoint, &CancellationToken::new()).await;
        });
    }
}

/// Create a savepoint and return a scoped handle. `cancel` is retained
/// on the scope and reused if `rollback()` is later called explicitly.
pub async fn create_savepoint_scope(
    tx: &Transaction,
    name: impl Into<String>,
    cancel: &CancellationToken,
) -> Result<SavepointScope> {
    let savepoint = tx.create_savepoint(name, cancel).await?;
    Ok(SavepointScope {
        tx: tx.clone(),
        savepoint,
        cancel: cancel.clone(),
        resolved: false,
    })
}

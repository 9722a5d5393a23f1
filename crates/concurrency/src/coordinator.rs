//! The transaction coordinator: the 2PC state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use reliablestore_core::{
    CancellationToken, Error, IsolationLevel, Result, ResourceId, Savepoint, TransactionId,
    TransactionOptions, TransactionState, TransactionalResource,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type CompletionCallback = Box<dyn Fn(TransactionState) + Send + Sync>;

struct Inner {
    id: TransactionId,
    state: Mutex<TransactionState>,
    isolation: IsolationLevel,
    timeout: Duration,
    created_at: Instant,
    enable_savepoints: bool,
    auto_rollback_on_dispose: bool,
    enlisted: DashMap<ResourceId, Arc<dyn TransactionalResource>>,
    enlistment_order: Mutex<Vec<ResourceId>>,
    savepoints: DashMap<String, Savepoint>,
    completion_callbacks: Mutex<Vec<CompletionCallback>>,
    completed: Mutex<bool>,
    // Durable marker set the instant the timer fires, independent of
    // `state`: the subsequent rollback moves `state` on to `RolledBack`
    // or `Failed` within milliseconds, but callers must keep seeing a
    // `Timeout`-typed error on any later call, not `InvalidState`.
    timed_out: AtomicBool,
    cancellation: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// A single unit of work coordinated by a 2PC state machine.
///
/// Cheap to clone — `Transaction` is a thin handle over an `Arc<Inner>`.
/// Cloning is how the ambient context and the timeout timer task each
/// hold their own reference without extending the borrow of the
/// caller's handle.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

/// A weak handle to a [`Transaction`], used by the completion-callback
/// metrics hook in [`crate::factory`] so it doesn't keep the
/// transaction's `Inner` alive by closing over a strong reference
/// (which would leak: `Inner` owns the callback list that owns the
/// closure that would own the strong reference right back).
pub(crate) struct WeakTransaction(std::sync::Weak<Inner>);

impl WeakTransaction {
    pub(crate) fn upgrade(&self) -> Option<Transaction> {
        self.0.upgrade().map(|inner| Transaction { inner })
    }
}

/// An external cancellation signal linked into a transaction's internal
/// cancellation for the lifetime of one coordinator call.
///
/// `token` is `external.child_token()` — it cancels whenever `external`
/// does — additionally cancelled by a short-lived watcher task whenever
/// this transaction's own internal token (timeout, `close()`) fires, so
/// resources only ever have to watch one token regardless of which
/// source cancelled first. The watcher is aborted on `Drop` so it never
/// outlives the call that created it.
struct LinkedCancellation {
    token: CancellationToken,
    watcher: JoinHandle<()>,
}

impl Drop for LinkedCancellation {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl Transaction {
    /// Create a new `Active` transaction and arm its timeout timer.
    ///
    /// Exposed for [`crate::factory`]; most callers should go through
    /// `factory::create_transaction` instead.
    pub fn new(options: TransactionOptions) -> Self {
        let id = TransactionId::new();
        let inner = Arc::new(Inner {
            id,
            state: Mutex::new(TransactionState::Active),
            isolation: options.isolation,
            timeout: options.timeout,
            created_at: Instant::now(),
            enable_savepoints: options.enable_savepoints,
            auto_rollback_on_dispose: options.auto_rollback_on_dispose,
            enlisted: DashMap::new(),
            enlistment_order: Mutex::new(Vec::new()),
            savepoints: DashMap::new(),
            completion_callbacks: Mutex::new(Vec::new()),
            completed: Mutex::new(false),
            timed_out: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
            timer: Mutex::new(None),
        });
        let tx = Self { inner };
        tx.arm_timer();
        info!(transaction_id = %tx.id(), timeout_ms = %tx.inner.timeout.as_millis(), "transaction created");
        tx
    }

    /// This transaction's unique id.
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// The advisory isolation tag recorded at creation.
    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    /// Whether the timeout timer has fired for this transaction, even
    /// if the triggered rollback has since moved `state()` on to
    /// `RolledBack` or `Failed`.
    pub fn timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    /// Whether savepoints were enabled via `TransactionOptions`.
    pub fn savepoints_enabled(&self) -> bool {
        self.inner.enable_savepoints
    }

    /// The cancellation token that fires on timeout or on `close()`.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub(crate) fn downgrade(&self) -> WeakTransaction {
        WeakTransaction(Arc::downgrade(&self.inner))
    }

    fn arm_timer(&self) {
        if self.inner.timeout.is_zero() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let tx = Transaction { inner };
            tx.on_timer_fired().await;
        });
        *self.inner.timer.lock() = Some(handle);
    }

    fn disarm_timer(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
    }

    async fn on_timer_fired(&self) {
        let fire = {
            let mut state = self.inner.state.lock();
            if matches!(*state, TransactionState::Active | TransactionState::Preparing) {
                *state = TransactionState::TimedOut;
                self.inner.timed_out.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        };
        if !fire {
            return;
        }
        warn!(transaction_id = %self.id(), "transaction timed out, scheduling rollback");
        self.inner.cancellation.cancel();
        let cancel = self.inner.cancellation.clone();
        let errors = self.fan_out_rollback(&cancel).await;
        let mut state = self.inner.state.lock();
        *state = if errors.is_empty() {
            TransactionState::RolledBack
        } else {
            TransactionState::Failed
        };
        drop(state);
        self.finish();
    }

    /// Enlist a resource.
    ///
    /// Fails with [`Error::InvalidState`] unless the transaction is
    /// `Active`, and with [`Error::DuplicateEnlistment`] if
    /// `resource.resource_id()` is already enlisted.
    pub fn enlist_resource(&self, resource: Arc<dyn TransactionalResource>) -> Result<()> {
        self.require_active()?;
        let id = resource.resource_id().clone();
        if self.inner.enlisted.contains_key(&id) {
            return Err(Error::DuplicateEnlistment {
                transaction_id: self.id(),
                resource_id: id,
            });
        }
        self.inner.enlisted.insert(id.clone(), resource);
        self.inner.enlistment_order.lock().push(id.clone());
        debug!(transaction_id = %self.id(), resource_id = %id, "resource enlisted");
        Ok(())
    }

    fn enlisted_snapshot(&self) -> Vec<(ResourceId, Arc<dyn TransactionalResource>)> {
        self.inner
            .enlistment_order
            .lock()
            .iter()
            .filter_map(|id| self.inner.enlisted.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }

    fn require_active(&self) -> Result<()> {
        // Checked ahead of `state`: once the timer has fired this flag
        // never clears, so every subsequent call sees a `Timeout`-typed
        // error even after the triggered rollback has moved `state()`
        // on to `RolledBack`/`Failed`.
        if self.inner.timed_out.load(Ordering::SeqCst) {
            return Err(Error::Timeout {
                transaction_id: self.id(),
                elapsed: self.inner.created_at.elapsed(),
            });
        }
        let state = *self.inner.state.lock();
        if state.is_active() {
            Ok(())
        } else {
            Err(Error::InvalidState {
                transaction_id: self.id(),
                state,
            })
        }
    }

    fn transition(&self, next: TransactionState) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.can_transition_to(next) {
            return Err(Error::InvalidState {
                transaction_id: self.id(),
                state: *state,
            });
        }
        debug!(transaction_id = %self.id(), from = %*state, to = %next, "state transition");
        *state = next;
        Ok(())
    }

    /// Register a callback invoked exactly once with the final state.
    ///
    /// If the transaction has already reached a terminal state, the
    /// callback is invoked immediately so the "exactly once" contract
    /// holds regardless of registration order.
    pub fn add_completion_callback<F>(&self, callback: F)
    where
        F: Fn(TransactionState) + Send + Sync + 'static,
    {
        let already_done = *self.inner.completed.lock();
        if already_done {
            callback(self.state());
            return;
        }
        self.inner.completion_callbacks.lock().push(Box::new(callback));
    }

    fn finish(&self) {
        let mut completed = self.inner.completed.lock();
        if *completed {
            return;
        }
        *completed = true;
        drop(completed);
        self.disarm_timer();
        let final_state = self.state();
        let callbacks = std::mem::take(&mut *self.inner.completion_callbacks.lock());
        for cb in callbacks {
            cb(final_state);
        }
        info!(transaction_id = %self.id(), state = %final_state, "transaction completed");
    }

    /// Derive a per-call cancellation token from `external` that also
    /// observes this transaction's own internal cancellation (timeout,
    /// `close()`). See [`LinkedCancellation`].
    fn link_cancellation(&self, external: &CancellationToken) -> LinkedCancellation {
        let token = external.child_token();
        let internal = self.inner.cancellation.clone();
        let watched = token.clone();
        let watcher = tokio::spawn(async move {
            internal.cancelled().await;
            watched.cancel();
        });
        LinkedCancellation { token, watcher }
    }

    /// Fan out `f` to every enlisted resource and await all results
    /// concurrently. Never aborted mid-flight by `cancel` — used for
    /// commit (Phase 2 must not be interrupted once started) and for
    /// rollback/savepoint bookkeeping, which must always run to
    /// completion once begun.
    async fn fan_out<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Vec<(ResourceId, std::result::Result<T, Error>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn TransactionalResource>, TransactionId, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.id();
        let (resource_ids, handles): (Vec<_>, Vec<_>) = self
            .enlisted_snapshot()
            .into_iter()
            .map(|(resource_id, resource)| {
                let fut = f(resource, id, cancel.clone());
                (resource_id, tokio::spawn(fut))
            })
            .unzip();

        // Fan-in: await every resource's task concurrently rather than
        // one at a time, so a slow resource doesn't serialize behind
        // whichever happened to be spawned first.
        let joined = futures::future::join_all(handles).await;

        resource_ids
            .into_iter()
            .zip(joined)
            .map(|(resource_id, joined)| {
                let result = match joined {
                    Ok(r) => r,
                    Err(join_err) => Err(Error::Backend {
                        resource_id: resource_id.clone(),
                        message: format!("resource task panicked: {join_err}"),
                    }),
                };
                (resource_id, result)
            })
            .collect()
    }

    /// Like [`Self::fan_out`], but races the whole fan-out against
    /// `cancel` and aborts every still-running resource task if
    /// cancellation wins — used only for Phase 1 (prepare), which
    /// aborts remaining prepares on cancellation rather than letting
    /// them run to completion.
    async fn fan_out_cancellable<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Option<Vec<(ResourceId, std::result::Result<T, Error>)>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn TransactionalResource>, TransactionId, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.id();
        let (resource_ids, handles): (Vec<_>, Vec<_>) = self
            .enlisted_snapshot()
            .into_iter()
            .map(|(resource_id, resource)| {
                let fut = f(resource, id, cancel.clone());
                (resource_id, tokio::spawn(fut))
            })
            .unzip();
        let abort_handles: Vec<tokio::task::AbortHandle> =
            handles.iter().map(|h| h.abort_handle()).collect();

        tokio::select! {
            _ = cancel.cancelled() => {
                for handle in &abort_handles {
                    handle.abort();
                }
                None
            }
            joined = futures::future::join_all(handles) => {
                Some(
                    resource_ids
                        .into_iter()
                        .zip(joined)
                        .map(|(resource_id, joined)| {
                            let result = match joined {
                                Ok(r) => r,
                                Err(join_err) => Err(Error::Backend {
                                    resource_id: resource_id.clone(),
                                    message: format!("resource task panicked: {join_err}"),
                                }),
                            };
                            (resource_id, result)
                        })
                        .collect(),
                )
            }
        }
    }

    async fn fan_out_rollback(&self, cancel: &CancellationToken) -> Vec<(ResourceId, Error)> {
        let results = self
            .fan_out(cancel, |resource, tx_id, cancel| async move {
                resource.rollback(tx_id, &cancel).await
            })
            .await;
        let mut errors = Vec::new();
        for (resource_id, result) in results {
            if let Err(err) = result {
                warn!(transaction_id = %self.id(), resource_id = %resource_id, error = %err, "rollback failed for resource");
                errors.push((resource_id, err));
            }
        }
        errors
    }

    /// Phase 1 + Phase 2 of two-phase commit.
    ///
    /// `cancel` is linked into the coordinator's own internal token for
    /// the duration of this call: firing it during Phase 1 aborts
    /// remaining prepares and triggers rollback; firing it after Phase 2
    /// has started does not abort in-flight commits.
    pub async fn commit(&self, cancel: &CancellationToken) -> Result<()> {
        self.require_active()?;
        self.transition(TransactionState::Preparing)?;
        let linked = self.link_cancellation(cancel);

        let Some(prepare_results) = self
            .fan_out_cancellable(&linked.token, |resource, tx_id, cancel| async move {
                resource.prepare(tx_id, &cancel).await
            })
            .await
        else {
            self.transition(TransactionState::RollingBack)?;
            let _ = self.fan_out_rollback(&linked.token).await;
            self.transition(TransactionState::Failed)?;
            self.finish();
            return Err(Error::Cancelled {
                transaction_id: self.id(),
            });
        };

        let mut prepare_cause: Option<Error> = None;
        let mut prepare_suppressed = Vec::new();
        for (resource_id, result) in prepare_results {
            match result {
                Ok(true) => {}
                Ok(false) => {
                    let err = Error::ValidationConflict {
                        resource_id: resource_id.clone(),
                        key: String::new(),
                    };
                    if prepare_cause.is_none() {
                        prepare_cause = Some(err);
                    } else {
                        prepare_suppressed.push(err);
                    }
                }
                Err(err) => {
                    if prepare_cause.is_none() {
                        prepare_cause = Some(err);
                    } else {
                        prepare_suppressed.push(err);
                    }
                }
            }
        }

        if let Some(cause) = prepare_cause {
            self.transition(TransactionState::RollingBack)?;
            let _rollback_errors = self.fan_out_rollback(&linked.token).await;
            self.transition(TransactionState::Failed)?;
            self.finish();
            return Err(Error::PrepareFailed {
                transaction_id: self.id(),
                cause: Box::new(cause),
                suppressed: prepare_suppressed,
            });
        }

        // Cancellation prevents *starting* further work once Phase 1
        // has cleared but before Phase 2 begins.
        if linked.token.is_cancelled() {
            self.transition(TransactionState::RollingBack)?;
            let _ = self.fan_out_rollback(&linked.token).await;
            self.transition(TransactionState::Failed)?;
            self.finish();
            return Err(Error::Cancelled {
                transaction_id: self.id(),
            });
        }

        self.transition(TransactionState::Prepared)?;
        self.transition(TransactionState::Committing)?;
        self.disarm_timer();

        let commit_results = self
            .fan_out(&linked.token, |resource, tx_id, cancel| async move {
                resource.commit(tx_id, &cancel).await
            })
            .await;

        let mut commit_cause: Option<Error> = None;
        let mut commit_suppressed = Vec::new();
        for (_resource_id, result) in commit_results {
            if let Err(err) = result {
                if commit_cause.is_none() {
                    commit_cause = Some(err);
                } else {
                    commit_suppressed.push(err);
                }
            }
        }

        if let Some(cause) = commit_cause {
            self.transition(TransactionState::RollingBack)?;
            let rollback_errors = self.fan_out_rollback(&linked.token).await;
            for (resource_id, err) in rollback_errors {
                commit_suppressed.push(Error::Backend {
                    resource_id,
                    message: err.to_string(),
                });
            }
            self.transition(TransactionState::Failed)?;
            self.finish();
            return Err(Error::CommitFailed {
                transaction_id: self.id(),
                cause: Box::new(cause),
                suppressed: commit_suppressed,
            });
        }

        self.transition(TransactionState::Committed)?;
        self.finish();
        Ok(())
    }

    /// Roll back. Idempotent: a no-op once the
    /// transaction has reached any terminal state.
    pub async fn rollback(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let state = *self.inner.state.lock();
            if state.is_terminal() {
                return Ok(());
            }
        }
        let linked = self.link_cancellation(cancel);
        self.transition(TransactionState::RollingBack)?;
        let errors = self.fan_out_rollback(&linked.token).await;
        let final_state = if errors.is_empty() {
            TransactionState::RolledBack
        } else {
            TransactionState::Failed
        };
        self.transition(final_state)?;
        self.finish();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::RollbackFailed {
                transaction_id: self.id(),
                causes: errors,
            })
        }
    }

    /// Create a savepoint.
    pub async fn create_savepoint(
        &self,
        name: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<Savepoint> {
        self.require_active()?;
        if !self.inner.enable_savepoints {
            return Err(Error::InvalidState {
                transaction_id: self.id(),
                state: self.state(),
            });
        }
        let name = name.into();
        if self.inner.savepoints.contains_key(&name) {
            return Err(Error::SavepointConflict {
                transaction_id: self.id(),
                name,
            });
        }
        let linked = self.link_cancellation(cancel);
        let savepoint = Savepoint::new(name.clone(), self.id());
        let sp = savepoint.clone();
        let results = self
            .fan_out(&linked.token, move |resource, tx_id, cancel| {
                let sp = sp.clone();
                async move { resource.create_savepoint(tx_id, &sp, &cancel).await }
            })
            .await;
        for (resource_id, result) in results {
            result.map_err(|err| {
                warn!(transaction_id = %self.id(), resource_id = %resource_id, error = %err, "create_savepoint failed for resource");
                err
            })?;
        }
        self.inner.savepoints.insert(name.clone(), savepoint.clone());
        debug!(transaction_id = %self.id(), savepoint = %name, "savepoint created");
        Ok(savepoint)
    }

    /// Roll back to a previously created savepoint. A missing savepoint
    /// is fatal at the coordinator: the transaction aborts to `Failed`.
    pub async fn rollback_to_savepoint(
        &self,
        savepoint: &Savepoint,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.require_active()?;
        if savepoint.transaction_id() != self.id() {
            return Err(Error::WrongTransactionSavepoint {
                transaction_id: self.id(),
                savepoint_transaction_id: savepoint.transaction_id(),
            });
        }
        let linked = self.link_cancellation(cancel);
        if !self.inner.savepoints.contains_key(savepoint.name()) {
            self.abort_to_failed(&linked.token).await;
            return Err(Error::SavepointMissing {
                transaction_id: self.id(),
                name: savepoint.name().to_string(),
            });
        }

        let sp = savepoint.clone();
        let results = self
            .fan_out(&linked.token, move |resource, tx_id, cancel| {
                let sp = sp.clone();
                async move { resource.rollback_to_savepoint(tx_id, &sp, &cancel).await }
            })
            .await;
        let mut failed = false;
        for (resource_id, result) in &results {
            if let Err(err) = result {
                warn!(transaction_id = %self.id(), resource_id = %resource_id, error = %err, "rollback_to_savepoint failed for resource");
                failed = true;
            }
        }
        if failed {
            self.abort_to_failed(&linked.token).await;
            let (resource_id, err) = results
                .into_iter()
                .find_map(|(id, r)| r.err().map(|e| (id, e)))
                .expect("failed flag implies at least one error");
            return Err(Error::Backend {
                resource_id,
                message: err.to_string(),
            });
        }

        let discarded: Vec<(String, Savepoint)> = self
            .inner
            .savepoints
            .iter()
            .filter(|entry| entry.value().created_at() > savepoint.created_at())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (name, _) in &discarded {
            self.inner.savepoints.remove(name);
        }
        for (_, sp) in discarded {
            let results = self
                .fan_out(&linked.token, move |resource, tx_id, cancel| {
                    let sp = sp.clone();
                    async move { resource.discard_savepoint_data(tx_id, &sp, &cancel).await }
                })
                .await;
            for (resource_id, result) in results {
                if let Err(err) = result {
                    warn!(transaction_id = %self.id(), resource_id = %resource_id, error = %err, "discard_savepoint_data failed for resource");
                }
            }
        }
        debug!(transaction_id = %self.id(), savepoint = %savepoint.name(), "rolled back to savepoint");
        Ok(())
    }

    async fn abort_to_failed(&self, cancel: &CancellationToken) {
        let can_roll_back = {
            let state = *self.inner.state.lock();
            state.can_transition_to(TransactionState::RollingBack)
        };
        if can_roll_back {
            let _ = self.transition(TransactionState::RollingBack);
            let _ = self.fan_out_rollback(cancel).await;
        }
        {
            let mut state = self.inner.state.lock();
            *state = TransactionState::Failed;
        }
        self.finish();
    }

    /// Explicit asynchronous teardown; prefer this over relying on
    /// `Drop`. If the
    /// transaction is still `Active`/`Preparing` and
    /// `auto_rollback_on_dispose` is set, drives rollback to
    /// completion before returning.
    pub async fn close(&self) {
        let should_rollback = {
            let state = *self.inner.state.lock();
            !state.is_terminal() && self.inner.auto_rollback_on_dispose
        };
        if should_rollback {
            let _ = self.rollback(&CancellationToken::new()).await;
        }
        self.inner.cancellation.cancel();
        self.disarm_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    struct CountingResource {
        id: ResourceId,
        prepare_calls: AtomicU32,
        commit_calls: AtomicU32,
        rollback_calls: AtomicU32,
        vote: bool,
    }

    impl CountingResource {
        fn new(id: &str, vote: bool) -> Arc<Self> {
            Arc::new(Self {
                id: ResourceId::new(id),
                prepare_calls: AtomicU32::new(0),
                commit_calls: AtomicU32::new(0),
                rollback_calls: AtomicU32::new(0),
                vote,
            })
        }
    }

    #[async_trait]
    impl TransactionalResource for CountingResource {
        fn resource_id(&self) -> &ResourceId {
            &self.id
        }
        async fn prepare(&self, _tx: TransactionId, _c: &CancellationToken) -> Result<bool> {
            self.prepare_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.vote)
        }
        async fn commit(&self, _tx: TransactionId, _c: &CancellationToken) -> Result<()> {
            self.commit_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(&self, _tx: TransactionId, _c: &CancellationToken) -> Result<()> {
            self.rollback_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn create_savepoint(&self, _tx: TransactionId, _sp: &Savepoint, _c: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn rollback_to_savepoint(&self, _tx: TransactionId, _sp: &Savepoint, _c: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn discard_savepoint_data(&self, _tx: TransactionId, _sp: &Savepoint, _c: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_votes_yes_reaches_committed() {
        let tx = Transaction::new(TransactionOptions::default());
        let r = CountingResource::new("r1", true);
        tx.enlist_resource(r.clone()).unwrap();
        tx.commit(&cancel()).await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(r.commit_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commit_votes_no_rolls_back_and_fails() {
        let tx = Transaction::new(TransactionOptions::default());
        let r = CountingResource::new("r1", false);
        tx.enlist_resource(r.clone()).unwrap();
        let err = tx.commit(&cancel()).await.unwrap_err();
        assert!(matches!(err, Error::PrepareFailed { .. }));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert_eq!(r.rollback_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_enlistment_of_same_resource_id_is_rejected() {
        let tx = Transaction::new(TransactionOptions::default());
        let r1 = CountingResource::new("dup", true);
        let r2 = CountingResource::new("dup", true);
        tx.enlist_resource(r1).unwrap();
        let err = tx.enlist_resource(r2).unwrap_err();
        assert!(matches!(err, Error::DuplicateEnlistment { .. }));
    }

    #[tokio::test]
    async fn enlisting_after_commit_is_rejected() {
        let tx = Transaction::new(TransactionOptions::default());
        tx.commit(&cancel()).await.unwrap();
        let r = CountingResource::new("late", true);
        let err = tx.enlist_resource(r).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn rollback_is_idempotent_after_commit() {
        let tx = Transaction::new(TransactionOptions::default());
        tx.commit(&cancel()).await.unwrap();
        tx.rollback(&cancel()).await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn savepoints_rejected_when_disabled_via_options() {
        let tx = Transaction::new(TransactionOptions::default().without_savepoints());
        let err = tx.create_savepoint("sp", &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn duplicate_savepoint_name_conflicts() {
        let tx = Transaction::new(TransactionOptions::default());
        tx.create_savepoint("sp", &cancel()).await.unwrap();
        let err = tx.create_savepoint("sp", &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::SavepointConflict { .. }));
    }

    #[tokio::test]
    async fn completion_callback_registered_after_completion_fires_immediately() {
        let tx = Transaction::new(TransactionOptions::default());
        tx.commit(&cancel()).await.unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tx.add_completion_callback(move |_state| flag.store(true, std::sync::atomic::Ordering::SeqCst));
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_timeout_never_arms_timer() {
        let opts = TransactionOptions::default().with_timeout(Duration::ZERO);
        let tx = Transaction::new(opts);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tx.state(), TransactionState::Active);
    }

    #[tokio::test]
    async fn commit_after_timeout_fired_returns_timeout_even_once_rolled_back() {
        let tx = Transaction::new(TransactionOptions::default().with_timeout(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        // By now the timer has already driven the rollback to completion
        // (state is RolledBack or Failed), not just TimedOut.
        assert!(tx.state() == TransactionState::RolledBack || tx.state() == TransactionState::Failed);
        assert!(tx.timed_out());
        let err = tx.commit(&cancel()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "expected Timeout, got {err:?}");
    }

    #[tokio::test]
    async fn external_cancellation_during_prepare_aborts_and_rolls_back() {
        struct SlowResource {
            id: ResourceId,
        }
        #[async_trait]
        impl TransactionalResource for SlowResource {
            fn resource_id(&self) -> &ResourceId {
                &self.id
            }
            async fn prepare(&self, _tx: TransactionId, cancel: &CancellationToken) -> Result<bool> {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(true),
                    _ = cancel.cancelled() => Ok(true),
                }
            }
            async fn commit(&self, _tx: TransactionId, _c: &CancellationToken) -> Result<()> {
                Ok(())
            }
            async fn rollback(&self, _tx: TransactionId, _c: &CancellationToken) -> Result<()> {
                Ok(())
            }
            async fn create_savepoint(&self, _tx: TransactionId, _sp: &Savepoint, _c: &CancellationToken) -> Result<()> {
                Ok(())
            }
            async fn rollback_to_savepoint(&self, _tx: TransactionId, _sp: &Savepoint, _c: &CancellationToken) -> Result<()> {
                Ok(())
            }
            async fn discard_savepoint_data(&self, _tx: TransactionId, _sp: &Savepoint, _c: &CancellationToken) -> Result<()> {
                Ok(())
            }
        }

        let tx = Transaction::new(TransactionOptions::default());
        tx.enlist_resource(Arc::new(SlowResource { id: "slow".into() })).unwrap();

        let external = CancellationToken::new();
        let to_cancel = external.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            to_cancel.cancel();
        });

        let err = tx.commit(&external).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }), "expected Cancelled, got {err:?}");
        assert_eq!(tx.state(), TransactionState::Failed);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Only the last handle tears anything down; clones (the ambient
        // slot, the timer task) dropping early must not fire a rollback.
        if Arc::strong_count(&self.inner) != 1 {
            return;
        }
        let state = *self.inner.state.lock();
        if state.is_terminal() || !self.inner.auto_rollback_on_dispose {
            self.inner.cancellation.cancel();
            self.disarm_timer();
            return;
        }
        // Synchronous dispose cannot `.await` a rollback.
        // Document the hazard rather than silently drop it: spawn a
        // detached best-effort rollback and warn loudly. Callers that
        // care about rollback errors must call `close()` explicitly.
        warn!(
            transaction_id = %self.inner.id,
            "transaction dropped without commit/close; scheduling best-effort async rollback \
             (errors from this rollback are not observable by the caller)"
        );
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let tx = Transaction { inner };
            let _ = tx.rollback(&CancellationToken::new()).await;
        });
    }
}

//! Transactional repository adapter.
//!
//! Converts a non-transactional `Repository<T, K>` into a
//! `TransactionalResource` by staging reads/writes in memory per
//! transaction and applying them only at commit.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reliablestore_core::{
    CancellationToken, Error, OperationKind, OperationRecord, Repository, ResourceId, Savepoint,
    TransactionId, TransactionalResource,
};
use tracing::debug;

type StagedMap<T, K> = DashMap<K, OperationRecord<T>>;

/// Wraps a [`Repository<T, K>`] and enlists transparently into whatever
/// transaction each call is made under, providing read-your-writes
/// isolation.
///
/// `key_of` extracts a backend entity's natural key via an explicit
/// closure supplied at construction, rather than reflection.
pub struct TransactionalRepositoryAdapter<T, K, R>
where
    T: Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    R: Repository<T, K>,
{
    resource_id: ResourceId,
    backend: Arc<R>,
    key_of: Arc<dyn Fn(&T) -> K + Send + Sync>,
    staged: DashMap<TransactionId, StagedMap<T, K>>,
    savepoint_snapshots: DashMap<(TransactionId, String), HashMap<K, OperationRecord<T>>>,
    seq: AtomicU64,
}

impl<T, K, R> TransactionalRepositoryAdapter<T, K, R>
where
    T: Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    R: Repository<T, K>,
{
    /// Wrap `backend` so it can be enlisted as a `TransactionalResource`.
    pub fn new(
        resource_id: impl Into<ResourceId>,
        backend: Arc<R>,
        key_of: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            backend,
            key_of: Arc::new(key_of),
            staged: DashMap::new(),
            savepoint_snapshots: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn staged_for(&self, tx: TransactionId) -> dashmap::mapref::one::RefMut<'_, TransactionId, StagedMap<T, K>> {
        self.staged.entry(tx).or_insert_with(DashMap::new)
    }

    /// Read-your-writes over any staged op for `(tx, key)`, falling
    /// back to the backend and recording a `Read` op on first touch.
    pub async fn get(
        &self,
        tx: TransactionId,
        key: &K,
        cancel: &CancellationToken,
    ) -> reliablestore_core::Result<Option<T>> {
        if let Some(existing) = self.staged_for(tx).get(key) {
            return Ok(match existing.kind {
                OperationKind::Insert | OperationKind::Update => existing.proposed.clone(),
                OperationKind::Delete => None,
                OperationKind::Read => existing.original.clone(),
            });
        }
        let value = self.backend.get(key, cancel).await?;
        let seq = self.next_seq();
        self.staged_for(tx)
            .entry(key.clone())
            .or_insert_with(|| OperationRecord::first_read(value.clone(), tx, seq));
        Ok(value)
    }

    /// Overlay staged ops onto a fresh backend read, then apply
    /// `predicate` in memory. Duplicate natural keys extracted from the
    /// backend are a configuration bug and surface as [`Error::Backend`].
    pub async fn get_all(
        &self,
        tx: TransactionId,
        predicate: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
        cancel: &CancellationToken,
    ) -> reliablestore_core::Result<Vec<T>> {
        let entries = self.backend.get_all(None, cancel).await?;
        let mut by_key: HashMap<K, T> = HashMap::with_capacity(entries.len());
        for (_, entity) in entries {
            let key = (self.key_of)(&entity);
            if by_key.insert(key, entity).is_some() {
                return Err(Error::Backend {
                    resource_id: self.resource_id.clone(),
                    message: "get_all: key_of produced a duplicate natural key".into(),
                });
            }
        }

        if let Some(staged) = self.staged.get(&tx) {
            for entry in staged.iter() {
                let key = entry.key().clone();
                match entry.value().kind {
                    OperationKind::Insert | OperationKind::Update => {
                        if let Some(value) = &entry.value().proposed {
                            by_key.insert(key, value.clone());
                        }
                    }
                    OperationKind::Delete => {
                        by_key.remove(&key);
                    }
                    OperationKind::Read => {}
                }
            }
        }

        let mut results: Vec<T> = by_key.into_values().collect();
        if let Some(predicate) = predicate {
            results.retain(|entity| predicate(entity));
        }
        Ok(results)
    }

    /// Stage a write. First write after no prior op records `original`
    /// from the backend; subsequent writes coalesce, preserving the
    /// first-observed `original`.
    pub async fn save(
        &self,
        tx: TransactionId,
        key: K,
        value: T,
        cancel: &CancellationToken,
    ) -> reliablestore_core::Result<()> {
        {
            let staged = self.staged_for(tx);
            if let Some(mut rec) = staged.get_mut(&key) {
                rec.coalesce_write(value);
                return Ok(());
            }
        }
        let original = self.backend.get(&key, cancel).await?;
        let seq = self.next_seq();
        let staged = self.staged_for(tx);
        staged
            .entry(key)
            .and_modify(|rec| rec.coalesce_write(value.clone()))
            .or_insert_with(|| OperationRecord::first_write(original, value, tx, seq));
        Ok(())
    }

    /// Stage a delete. Collapses any existing op to `Delete`, keeping
    /// the first-observed `original`.
    pub async fn delete(
        &self,
        tx: TransactionId,
        key: K,
        cancel: &CancellationToken,
    ) -> reliablestore_core::Result<()> {
        {
            let staged = self.staged_for(tx);
            if let Some(mut rec) = staged.get_mut(&key) {
                rec.coalesce_delete();
                return Ok(());
            }
        }
        let original = self.backend.get(&key, cancel).await?;
        let seq = self.next_seq();
        let staged = self.staged_for(tx);
        staged
            .entry(key)
            .and_modify(|rec| rec.coalesce_delete())
            .or_insert_with(|| OperationRecord::first_delete(original, tx, seq));
        Ok(())
    }

    fn drop_transaction_state(&self, tx: TransactionId) {
        self.staged.remove(&tx);
        self.savepoint_snapshots.retain(|(id, _), _| *id != tx);
    }
}

#[async_trait]
impl<T, K, R> TransactionalResource for TransactionalRepositoryAdapter<T, K, R>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    R: Repository<T, K>,
{
    fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    async fn prepare(
        &self,
        transaction_id: TransactionId,
        cancel: &CancellationToken,
    ) -> reliablestore_core::Result<bool> {
        let Some(staged) = self.staged.get(&transaction_id) else {
            return Ok(true);
        };
        // Snapshot keys first: re-reading the backend is a suspension
        // point and must not hold a DashMap shard guard across `.await`.
        let ops: Vec<(K, OperationKind, Option<T>)> = staged
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().kind, entry.value().original.clone()))
            .collect();
        drop(staged);

        for (key, kind, original) in ops {
            match kind {
                OperationKind::Read => continue,
                OperationKind::Insert => {
                    let current = self.backend.get(&key, cancel).await?;
                    if current.is_some() {
                        debug!(resource_id = %self.resource_id, "prepare: insert conflict, key already exists");
                        return Ok(false);
                    }
                }
                OperationKind::Update | OperationKind::Delete => {
                    let current = self.backend.get(&key, cancel).await?;
                    if current != original {
                        debug!(resource_id = %self.resource_id, "prepare: optimistic validation failed");
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn commit(
        &self,
        transaction_id: TransactionId,
        cancel: &CancellationToken,
    ) -> reliablestore_core::Result<()> {
        let Some((_, staged)) = self.staged.remove(&transaction_id) else {
            return Ok(());
        };
        let mut ops: Vec<(K, OperationRecord<T>)> =
            staged.into_iter().collect::<Vec<_>>();
        ops.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then(a.1.seq.cmp(&b.1.seq)));

        for (key, op) in ops {
            match op.kind {
                OperationKind::Insert | OperationKind::Update => {
                    let value = op.proposed.expect("insert/update always carries a proposed value");
                    self.backend.save(key, value, cancel).await?;
                }
                OperationKind::Delete => {
                    self.backend.delete(&key, cancel).await?;
                }
                OperationKind::Read => {}
            }
        }
        self.savepoint_snapshots.retain(|(id, _), _| *id != transaction_id);
        Ok(())
    }

    async fn rollback(
        &self,
        transaction_id: TransactionId,
        _cancel: &CancellationToken,
    ) -> reliablestore_core::Result<()> {
        self.drop_transaction_state(transaction_id);
        Ok(())
    }

    async fn create_savepoint(
        &self,
        transaction_id: TransactionId,
        savepoint: &Savepoint,
        _cancel: &CancellationToken,
    ) -> reliablestore_core::Result<()> {
        let snapshot: HashMap<K, OperationRecord<T>> = self
            .staged
            .get(&transaction_id)
            .map(|staged| staged.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
            .unwrap_or_default();
        self.savepoint_snapshots
            .insert((transaction_id, savepoint.name().to_string()), snapshot);
        Ok(())
    }

    async fn rollback_to_savepoint(
        &self,
        transaction_id: TransactionId,
        savepoint: &Savepoint,
        _cancel: &CancellationToken,
    ) -> reliablestore_core::Result<()> {
        // A missing snapshot here (this resource was enlisted after the
        // savepoint was created) is a no-op — only the coordinator's
        // registry is authoritative on whether the savepoint itself exists.
        let Some(snapshot) = self
            .savepoint_snapshots
            .get(&(transaction_id, savepoint.name().to_string()))
        else {
            return Ok(());
        };
        let restored: StagedMap<T, K> = DashMap::new();
        for (key, op) in snapshot.iter() {
            restored.insert(key.clone(), op.clone());
        }
        drop(snapshot);
        self.staged.insert(transaction_id, restored);
        Ok(())
    }

    async fn discard_savepoint_data(
        &self,
        transaction_id: TransactionId,
        savepoint: &Savepoint,
        _cancel: &CancellationToken,
    ) -> reliablestore_core::Result<()> {
        self.savepoint_snapshots
            .remove(&(transaction_id, savepoint.name().to_string()));
        Ok(())
    }
}

//! The minimal CRUD surface an adapter consumes from a backend.
//!
//! `Repository<T, K>` is deliberately not transactional on its own —
//! durability is per-operation. `TransactionalRepositoryAdapter` (in
//! `reliablestore-concurrency`) is responsible for making a sequence of
//! `save`/`delete` calls appear atomic.

use crate::cancellation::CancellationToken;
use crate::error::Result;
use async_trait::async_trait;
use std::hash::Hash;

/// A non-transactional CRUD backend over entities of type `T` keyed by `K`.
#[async_trait]
pub trait Repository<T, K>: Send + Sync
where
    T: Send + Sync + Clone,
    K: Send + Sync + Eq + Hash + Clone,
{
    /// Fetch one entity by key.
    async fn get(&self, key: &K, cancel: &CancellationToken) -> Result<Option<T>>;

    /// Fetch several entities by key; missing keys are simply absent
    /// from the result, not an error.
    async fn get_many(&self, keys: &[K], cancel: &CancellationToken) -> Result<Vec<(K, T)>>;

    /// Fetch every entity, optionally filtered by `predicate`.
    async fn get_all(
        &self,
        predicate: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(K, T)>>;

    /// Upsert one entity.
    async fn save(&self, key: K, entity: T, cancel: &CancellationToken) -> Result<()>;

    /// Upsert a batch of entities.
    async fn save_many(&self, entries: Vec<(K, T)>, cancel: &CancellationToken) -> Result<()>;

    /// Delete by key; returns whether a value was actually removed.
    async fn delete(&self, key: &K, cancel: &CancellationToken) -> Result<bool>;

    /// Check existence without fetching the value.
    async fn exists(&self, key: &K, cancel: &CancellationToken) -> Result<bool>;
}

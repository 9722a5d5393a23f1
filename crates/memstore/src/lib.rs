//! In-memory `Repository<T, K>` reference backend for ReliableStore.
//!
//! Not a production backend — no persistence, no compression, no
//! connection/retry policy. It exists purely so the coordinator and
//! the transactional repository adapter have something to drive in
//! tests and doctests; real backends (file, SQL, registry) are external
//! collaborators this crate does not attempt to be.

#![warn(missing_docs)]

use std::hash::Hash;

use async_trait::async_trait;
use dashmap::DashMap;
use reliablestore_core::{CancellationToken, Repository, Result};

/// A `DashMap<K, T>` behind the [`Repository`] trait.
///
/// Every operation is per-call atomic (a single `DashMap` access) but
/// not transactional across multiple calls — that's
/// `TransactionalRepositoryAdapter`'s job, one layer up in
/// `reliablestore-concurrency`.
#[derive(Debug, Default)]
pub struct InMemoryRepository<T, K>
where
    K: Eq + Hash + Clone,
{
    data: DashMap<K, T>,
}

impl<T, K> InMemoryRepository<T, K>
where
    K: Eq + Hash + Clone,
{
    /// An empty repository.
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Seed the repository with initial entries, useful for setting up
    /// scenario tests.
    pub fn seeded(entries: impl IntoIterator<Item = (K, T)>) -> Self {
        let data = DashMap::new();
        for (k, v) in entries {
            data.insert(k, v);
        }
        Self { data }
    }

    /// Number of entities currently stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the repository holds no entities.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl<T, K> Repository<T, K> for InMemoryRepository<T, K>
where
    T: Send + Sync + Clone,
    K: Send + Sync + Eq + Hash + Clone,
{
    async fn get(&self, key: &K, _cancel: &CancellationToken) -> Result<Option<T>> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn get_many(&self, keys: &[K], _cancel: &CancellationToken) -> Result<Vec<(K, T)>> {
        Ok(keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn get_all(
        &self,
        predicate: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<(K, T)>> {
        Ok(self
            .data
            .iter()
            .filter(|entry| predicate.map(|p| p(entry.value())).unwrap_or(true))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn save(&self, key: K, entity: T, _cancel: &CancellationToken) -> Result<()> {
        self.data.insert(key, entity);
        Ok(())
    }

    async fn save_many(&self, entries: Vec<(K, T)>, _cancel: &CancellationToken) -> Result<()> {
        for (k, v) in entries {
            self.data.insert(k, v);
        }
        Ok(())
    }

    async fn delete(&self, key: &K, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn exists(&self, key: &K, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.data.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliablestore_core::CancellationToken;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let repo: InMemoryRepository<i32, String> = InMemoryRepository::new();
        let c = cancel();
        repo.save("a".to_string(), 1, &c).await.unwrap();
        assert_eq!(repo.get(&"a".to_string(), &c).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn delete_reports_whether_a_value_was_removed() {
        let repo: InMemoryRepository<i32, String> = InMemoryRepository::new();
        let c = cancel();
        repo.save("a".to_string(), 1, &c).await.unwrap();
        assert!(repo.delete(&"a".to_string(), &c).await.unwrap());
        assert!(!repo.delete(&"a".to_string(), &c).await.unwrap());
    }

    #[tokio::test]
    async fn seeded_repository_is_queryable_immediately() {
        let repo = InMemoryRepository::seeded([("a".to_string(), 1), ("b".to_string(), 2)]);
        let c = cancel();
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.get(&"b".to_string(), &c).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn get_all_applies_predicate() {
        let repo = InMemoryRepository::seeded([("a".to_string(), 1), ("b".to_string(), 2)]);
        let c = cancel();
        let evens = repo.get_all(Some(&|v: &i32| v % 2 == 0), &c).await.unwrap();
        assert_eq!(evens, vec![("b".to_string(), 2)]);
    }
}

//! ReliableStore — a pluggable, transactional key-value persistence
//! layer providing two-phase-commit transaction coordination over a
//! non-transactional `Repository<T, K>` backend.
//!
//! This facade crate re-exports [`reliablestore_core`] (data model and
//! contracts) and [`reliablestore_concurrency`] (the coordinator,
//! ambient context, repository adapter, and factory/scope helpers) so
//! a consumer depends on one crate for the core. Concrete backends
//! (e.g. [`reliablestore_memstore`]) are collaborators, not part of
//! this facade.
//!
//! ```
//! use std::sync::Arc;
//! use reliablestore::concurrency::factory;
//! use reliablestore::concurrency::adapter::TransactionalRepositoryAdapter;
//! use reliablestore::core::CancellationToken;
//! use reliablestore_memstore::InMemoryRepository;
//!
//! # #[tokio::main]
//! # async fn main() -> reliablestore::core::Result<()> {
//! let backend = Arc::new(InMemoryRepository::<i64, String>::new());
//! let adapter = Arc::new(TransactionalRepositoryAdapter::new(
//!     "balances",
//!     backend,
//!     |v: &i64| v.to_string(),
//! ));
//!
//! let cancel = CancellationToken::new();
//! factory::execute_in_transaction(Default::default(), |tx| {
//!     let adapter = adapter.clone();
//!     async move {
//!         tx.enlist_resource(adapter.clone())?;
//!         adapter.save(tx.id(), "alice".into(), 100, tx.cancellation()).await?;
//!         Ok(())
//!     }
//! }, &cancel)
//! .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Data model, contracts, and error taxonomy.
pub use reliablestore_core as core;
/// Transaction coordinator, ambient context, repository adapter, and
/// factory/scope helpers.
pub use reliablestore_concurrency as concurrency;

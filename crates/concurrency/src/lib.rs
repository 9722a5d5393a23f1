//! Transaction coordinator, ambient context, repository adapter and
//! factory/scope helpers for ReliableStore.
//!
//! This crate has no knowledge of any concrete backend — it drives
//! whatever implements `reliablestore_core::TransactionalResource`,
//! including the `TransactionalRepositoryAdapter` defined here over any
//! `reliablestore_core::Repository<T, K>`.

#![warn(missing_docs)]

pub mod adapter;
pub mod ambient;
pub mod coordinator;
pub mod factory;

pub use adapter::TransactionalRepositoryAdapter;
pub use coordinator::Transaction;
pub use factory::{
    create_savepoint_scope, create_transaction, current, enlist_in_current,
    execute_in_transaction, execute_with_retry, metrics, Metrics, SavepointScope,
};

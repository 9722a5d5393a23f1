//! Core types and contracts for ReliableStore
//!
//! This crate defines the foundational vocabulary shared by the
//! transaction coordinator and the transactional repository adapter:
//!
//! - [`TransactionId`] / [`ResourceId`]: identity types
//! - [`TransactionState`]: the 2PC state machine
//! - [`IsolationLevel`] / [`TransactionOptions`]: advisory tag and
//!   per-transaction configuration
//! - [`Savepoint`]: named, ordered markers inside an active transaction
//! - [`OperationKind`] / [`OperationRecord`]: the staged-op record
//! - [`Repository`]: the minimal CRUD surface a backend exposes
//! - [`TransactionalResource`]: the 2PC participant contract
//! - [`Error`] / [`Result`]: the error taxonomy
//!
//! This crate has no knowledge of any concrete backend or of the
//! coordinator's fan-out logic — both live in `reliablestore-concurrency`.

#![warn(missing_docs)]

pub mod cancellation;
pub mod error;
pub mod ids;
pub mod isolation;
pub mod operation;
pub mod options;
pub mod repository;
pub mod resource;
pub mod savepoint;
pub mod state;

pub use cancellation::CancellationToken;
pub use error::{Error, Result};
pub use ids::{ResourceId, TransactionId};
pub use isolation::IsolationLevel;
pub use operation::{OperationKind, OperationRecord};
pub use options::TransactionOptions;
pub use repository::Repository;
pub use resource::TransactionalResource;
pub use savepoint::Savepoint;
pub use state::TransactionState;

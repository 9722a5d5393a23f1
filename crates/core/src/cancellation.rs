//! Cancellation primitive shared by the coordinator and every resource.
//!
//! Re-exports `tokio_util::sync::CancellationToken`: a cloneable,
//! hierarchical signal that survives being passed across `.await`
//! points, so it can be propagated to resources without every backend
//! call having to know why it was cancelled. Each public coordinator
//! method (`commit`, `rollback`, `create_savepoint`,
//! `rollback_to_savepoint`) takes an external token and derives a
//! per-call token via `external.child_token()`, then spawns a short-lived
//! watcher that also cancels that derived token when the coordinator's
//! own internal token (timeout, `close()`) fires — so resources always
//! see one token that reflects whichever source cancelled first.

pub use tokio_util::sync::CancellationToken;

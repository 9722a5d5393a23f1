//! Staged operation records — the adapter's in-memory undo-free log.
//!
//! A staged-op map replaces a per-op undo log, which is the right
//! shape because backends do not support rollback themselves.
//! Coalescing must preserve the *first-observed* `original` so
//! optimistic validation at prepare time stays meaningful.

use crate::ids::TransactionId;
use std::time::Instant;

/// What kind of staged mutation a key has pending in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Read-only; tracked so `original` can be validated at prepare.
    Read,
    /// The key did not exist when first written in this transaction.
    Insert,
    /// The key existed when first written in this transaction.
    Update,
    /// The key is staged for removal.
    Delete,
}

/// A single key's staged operation within one transaction.
///
/// `original` is always the value observed the *first* time this key
/// was touched (read or written) in this transaction; `proposed` is the
/// value that would be applied at commit (`None` for `Read`/`Delete`).
#[derive(Debug, Clone)]
pub struct OperationRecord<V> {
    /// What kind of mutation is staged.
    pub kind: OperationKind,
    /// The value observed the first time this key was touched.
    pub original: Option<V>,
    /// The value that would be applied at commit.
    pub proposed: Option<V>,
    /// When this record was last coalesced; used to order commit application.
    pub timestamp: Instant,
    /// The transaction this staged operation belongs to.
    pub transaction_id: TransactionId,
    /// Monotonic insertion order, assigned once at first touch. Used only
    /// to break ties when two records share a `timestamp`, so ties are
    /// broken by insertion order.
    pub seq: u64,
}

impl<V: Clone> OperationRecord<V> {
    /// Record the first observed read of a key that had no prior op.
    pub fn first_read(original: Option<V>, transaction_id: TransactionId, seq: u64) -> Self {
        Self {
            kind: OperationKind::Read,
            original,
            proposed: None,
            timestamp: Instant::now(),
            transaction_id,
            seq,
        }
    }

    /// Record the first write (`Save`) to a key that had no prior op.
    ///
    /// `kind` is `Insert` when `original` is `None`, else `Update`.
    pub fn first_write(
        original: Option<V>,
        proposed: V,
        transaction_id: TransactionId,
        seq: u64,
    ) -> Self {
        let kind = if original.is_none() {
            OperationKind::Insert
        } else {
            OperationKind::Update
        };
        Self {
            kind,
            original,
            proposed: Some(proposed),
            timestamp: Instant::now(),
            transaction_id,
            seq,
        }
    }

    /// Record the first delete of a key that had no prior op.
    pub fn first_delete(original: Option<V>, transaction_id: TransactionId, seq: u64) -> Self {
        Self {
            kind: OperationKind::Delete,
            original,
            proposed: None,
            timestamp: Instant::now(),
            transaction_id,
            seq,
        }
    }

    /// Coalesce a subsequent write into this record, preserving the
    /// first-observed `original` and promoting `Delete -> Insert` when
    /// the new value is non-null.
    pub fn coalesce_write(&mut self, proposed: V) {
        self.kind = match self.kind {
            OperationKind::Delete => OperationKind::Insert,
            OperationKind::Read if self.original.is_some() => OperationKind::Update,
            OperationKind::Read => OperationKind::Insert,
            other => other,
        };
        self.proposed = Some(proposed);
        self.timestamp = Instant::now();
    }

    /// Coalesce a subsequent delete into this record: collapses to
    /// `Delete`, keeping the first-observed `original`.
    pub fn coalesce_delete(&mut self) {
        self.kind = OperationKind::Delete;
        self.proposed = None;
        self.timestamp = Instant::now();
    }

    /// Coalesce a subsequent read: reads never change an existing
    /// record (they are never "promoted" into a write).
    pub fn coalesce_read(&self) {}
}

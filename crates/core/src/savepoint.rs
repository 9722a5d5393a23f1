//! Savepoints: named, ordered markers inside an active transaction.

use crate::ids::TransactionId;
use std::time::Instant;

/// An immutable marker created inside an `Active` transaction.
///
/// Savepoints are ordered by `created_at`; rolling back to one discards
/// every savepoint created after it, both in the coordinator's registry
/// and in every enlisted resource's snapshot store.
#[derive(Debug, Clone)]
pub struct Savepoint {
    name: String,
    transaction_id: TransactionId,
    created_at: Instant,
}

impl Savepoint {
    /// Construct a savepoint. Only the coordinator should call this —
    /// it is the sole authority for what savepoints exist.
    pub fn new(name: impl Into<String>, transaction_id: TransactionId) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            created_at: Instant::now(),
        }
    }

    /// The savepoint's name, unique within its transaction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transaction this savepoint belongs to.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Creation instant, used only for relative ordering between
    /// savepoints of the same transaction.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl PartialEq for Savepoint {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.transaction_id == other.transaction_id
    }
}
impl Eq for Savepoint {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_savepoint_has_later_created_at() {
        let tx = TransactionId::new();
        let sp1 = Savepoint::new("sp1", tx);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let sp2 = Savepoint::new("sp2", tx);
        assert!(sp2.created_at() > sp1.created_at());
    }
}

//! Advisory isolation tag.
//!
//! The core always enforces read-committed plus read-your-writes with
//! optimistic validation at prepare time, regardless of which tag is
//! recorded here. The tag exists purely so callers can annotate intent
//! and so it can be surfaced in logs and metrics.

use std::fmt;

/// Advisory isolation level recorded on a transaction for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IsolationLevel::ReadUncommitted => "ReadUncommitted",
            IsolationLevel::ReadCommitted => "ReadCommitted",
            IsolationLevel::RepeatableRead => "RepeatableRead",
            IsolationLevel::Snapshot => "Snapshot",
            IsolationLevel::Serializable => "Serializable",
        };
        write!(f, "{label}")
    }
}

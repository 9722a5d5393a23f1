//! Transaction state machine.
//!
//! States and transitions follow the commit and rollback paths below:
//!
//! ```text
//! Active       --commit-->   Preparing
//! Active       --rollback->  RollingBack
//! Active       --timeout-->  TimedOut
//! Preparing    --all ok-->   Prepared --> Committing
//! Preparing    --any fail--> RollingBack --> Failed
//! Committing   --all ok-->   Committed            (terminal)
//! Committing   --any fail--> RollingBack --> Failed (terminal)
//! RollingBack  -->           RolledBack | Failed    (terminal)
//! TimedOut     -->           RolledBack | Failed    (terminal)
//! ```

use std::fmt;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Transaction accepts reads, writes, enlistments and savepoints.
    Active,
    /// Phase 1 (prepare) is in flight.
    Preparing,
    /// All enlisted resources voted ready; about to enter Phase 2.
    Prepared,
    /// Phase 2 (commit) is in flight.
    Committing,
    /// Phase 2 completed on every enlisted resource.
    Committed,
    /// Rollback is in flight (from Active, Preparing, or on timeout).
    RollingBack,
    /// Rollback completed cleanly.
    RolledBack,
    /// Terminal failure: a prepare/commit exception, or a failure
    /// during a rollback-to-savepoint.
    Failed,
    /// The timeout timer fired before the transaction reached Prepared.
    TimedOut,
}

impl TransactionState {
    /// Whether this state is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed
                | TransactionState::RolledBack
                | TransactionState::Failed
        )
    }

    /// Whether operations requiring an active transaction (enlistment,
    /// savepoint creation, commit/rollback-to-savepoint) are permitted.
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Validate a proposed transition against the monotonic state
    /// graph. Returns `false` for any transition not listed above,
    /// including all transitions out of a terminal state.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        match (*self, next) {
            (Active, Preparing) => true,
            (Active, RollingBack) => true,
            (Active, TimedOut) => true,
            (Preparing, Prepared) => true,
            (Preparing, RollingBack) => true,
            (Preparing, TimedOut) => true,
            (Prepared, Committing) => true,
            (Committing, Committed) => true,
            (Committing, RollingBack) => true,
            (RollingBack, RolledBack) => true,
            (RollingBack, Failed) => true,
            (TimedOut, RolledBack) => true,
            (TimedOut, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransactionState::Active => "Active",
            TransactionState::Preparing => "Preparing",
            TransactionState::Prepared => "Prepared",
            TransactionState::Committing => "Committing",
            TransactionState::Committed => "Committed",
            TransactionState::RollingBack => "RollingBack",
            TransactionState::RolledBack => "RolledBack",
            TransactionState::Failed => "Failed",
            TransactionState::TimedOut => "TimedOut",
        };
        write!(f, "{label}")
    }
}

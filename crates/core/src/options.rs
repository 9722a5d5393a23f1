//! Transaction options.

use crate::isolation::IsolationLevel;
use std::collections::HashMap;
use std::time::Duration;

/// Options controlling a single transaction's behavior.
///
/// Defaults: `ReadCommitted`, 5 minute timeout,
/// savepoints enabled, auto-rollback on dispose enabled.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Advisory isolation tag; see [`IsolationLevel`].
    pub isolation: IsolationLevel,
    /// Duration after which the coordinator autonomously drives
    /// rollback if the transaction has not reached `Prepared`.
    pub timeout: Duration,
    /// Whether `create_savepoint`/`rollback_to_savepoint` are permitted
    /// on this transaction.
    pub enable_savepoints: bool,
    /// Whether dropping an `Active` transaction without an explicit
    /// commit/rollback triggers a best-effort rollback.
    pub auto_rollback_on_dispose: bool,
    /// Opaque user annotations, carried through to log fields but
    /// otherwise unused by the core.
    pub properties: HashMap<String, String>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            timeout: Duration::from_secs(5 * 60),
            enable_savepoints: true,
            auto_rollback_on_dispose: true,
            properties: HashMap::new(),
        }
    }
}

impl TransactionOptions {
    /// Start from the defaults and override the timeout — the most
    /// commonly customized option in tests and short-lived scripts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the isolation tag.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Disable savepoint support for this transaction.
    pub fn without_savepoints(mut self) -> Self {
        self.enable_savepoints = false;
        self
    }

    /// Disable the auto-rollback-on-dispose behavior.
    pub fn without_auto_rollback(mut self) -> Self {
        self.auto_rollback_on_dispose = false;
        self
    }

    /// Attach a user-defined property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = TransactionOptions::default();
        assert_eq!(opts.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(opts.timeout, Duration::from_secs(300));
        assert!(opts.enable_savepoints);
        assert!(opts.auto_rollback_on_dispose);
        assert!(opts.properties.is_empty());
    }

    #[test]
    fn builder_overrides_compose() {
        let opts = TransactionOptions::default()
            .with_timeout(Duration::from_millis(50))
            .without_savepoints()
            .with_property("caller", "billing-job");
        assert_eq!(opts.timeout, Duration::from_millis(50));
        assert!(!opts.enable_savepoints);
        assert_eq!(opts.properties.get("caller").map(String::as_str), Some("billing-job"));
    }
}

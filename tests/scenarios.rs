//! End-to-end scenarios covering multi-resource commit, prepare
//! conflicts, savepoints, timeouts, and retry, run against
//! `reliablestore_memstore::InMemoryRepository`.

use std::sync::Arc;
use std::time::Duration;

use reliablestore::concurrency::adapter::TransactionalRepositoryAdapter;
use reliablestore::concurrency::coordinator::Transaction;
use reliablestore::concurrency::factory;
use reliablestore::core::{Error, Repository, TransactionOptions};
use reliablestore_memstore::InMemoryRepository;

type StringAdapter = TransactionalRepositoryAdapter<String, String, InMemoryRepository<String, String>>;

static TRACING_INIT: std::sync::Once = std::sync::Once::new();

/// Install a test-scoped `tracing` subscriber once per process, so a
/// failing scenario's `debug!`/`warn!` output from the coordinator and
/// adapter shows up under `cargo test -- --nocapture`.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn adapter(resource_id: &'static str, backend: Arc<InMemoryRepository<String, String>>) -> Arc<StringAdapter> {
    Arc::new(TransactionalRepositoryAdapter::new(resource_id, backend, |v: &String| v.clone()))
}

/// Scenario 1: happy-path multi-resource commit.
#[tokio::test]
async fn happy_path_multi_resource_commit() {
    init_tracing();
    let backend_a = Arc::new(InMemoryRepository::seeded([("a".to_string(), "1".to_string())]));
    let backend_b = Arc::new(InMemoryRepository::<String, String>::new());
    let adapter_a = adapter("A", backend_a.clone());
    let adapter_b = adapter("B", backend_b.clone());

    let tx = Transaction::new(TransactionOptions::default());
    tx.enlist_resource(adapter_a.clone()).unwrap();
    tx.enlist_resource(adapter_b.clone()).unwrap();

    adapter_a
        .save(tx.id(), "a".into(), "2".into(), tx.cancellation())
        .await
        .unwrap();
    adapter_b
        .save(tx.id(), "x".into(), "9".into(), tx.cancellation())
        .await
        .unwrap();

    tx.commit(tx.cancellation()).await.unwrap();

    let c = tx.cancellation().clone();
    assert_eq!(backend_a.get(&"a".to_string(), &c).await.unwrap(), Some("2".to_string()));
    assert_eq!(backend_b.get(&"x".to_string(), &c).await.unwrap(), Some("9".to_string()));
}

/// Scenario 2: a concurrent external mutation makes prepare fail and
/// rolls everything back.
#[tokio::test]
async fn prepare_conflict_rolls_everything_back() {
    init_tracing();
    let backend_a = Arc::new(InMemoryRepository::seeded([("k".to_string(), "v1".to_string())]));
    let adapter_a = adapter("A", backend_a.clone());

    let tx = Transaction::new(TransactionOptions::default());
    tx.enlist_resource(adapter_a.clone()).unwrap();

    // Read "k" inside the transaction first, recording original = "v1".
    let _ = adapter_a.get(tx.id(), &"k".to_string(), tx.cancellation()).await.unwrap();

    // Backend mutates externally, outside this transaction.
    backend_a
        .save("k".to_string(), "v1-external".to_string(), tx.cancellation())
        .await
        .unwrap();

    adapter_a
        .save(tx.id(), "k".into(), "v2".into(), tx.cancellation())
        .await
        .unwrap();

    let err = tx.commit(tx.cancellation()).await.unwrap_err();
    assert!(matches!(err, Error::PrepareFailed { .. }));

    let c = tx.cancellation().clone();
    assert_eq!(
        backend_a.get(&"k".to_string(), &c).await.unwrap(),
        Some("v1-external".to_string())
    );
}

/// Scenario 3: savepoint partial rollback.
#[tokio::test]
async fn savepoint_partial_rollback() {
    init_tracing();
    let backend_a = Arc::new(InMemoryRepository::<String, String>::new());
    let adapter_a = adapter("A", backend_a.clone());

    let tx = Transaction::new(TransactionOptions::default());
    tx.enlist_resource(adapter_a.clone()).unwrap();

    adapter_a.save(tx.id(), "a".into(), "1".into(), tx.cancellation()).await.unwrap();
    let sp1 = tx.create_savepoint("sp1", tx.cancellation()).await.unwrap();
    adapter_a.save(tx.id(), "b".into(), "2".into(), tx.cancellation()).await.unwrap();
    let _sp2 = tx.create_savepoint("sp2", tx.cancellation()).await.unwrap();
    adapter_a.save(tx.id(), "c".into(), "3".into(), tx.cancellation()).await.unwrap();

    tx.rollback_to_savepoint(&sp1, tx.cancellation()).await.unwrap();

    // sp2 must have been discarded: rolling back to it again fails.
    let stale = reliablestore_core::Savepoint::new("sp2", tx.id());
    let err = tx.rollback_to_savepoint(&stale, tx.cancellation()).await.unwrap_err();
    assert!(matches!(err, Error::SavepointMissing { .. }));
}

/// Scenario 3 (continued, fresh transaction): after a partial rollback
/// only the pre-savepoint write survives commit.
#[tokio::test]
async fn savepoint_partial_rollback_then_commit() {
    init_tracing();
    let backend_a = Arc::new(InMemoryRepository::<String, String>::new());
    let adapter_a = adapter("A", backend_a.clone());

    let tx = Transaction::new(TransactionOptions::default());
    tx.enlist_resource(adapter_a.clone()).unwrap();

    adapter_a.save(tx.id(), "a".into(), "1".into(), tx.cancellation()).await.unwrap();
    let sp1 = tx.create_savepoint("sp1", tx.cancellation()).await.unwrap();
    adapter_a.save(tx.id(), "b".into(), "2".into(), tx.cancellation()).await.unwrap();
    tx.create_savepoint("sp2", tx.cancellation()).await.unwrap();
    adapter_a.save(tx.id(), "c".into(), "3".into(), tx.cancellation()).await.unwrap();

    tx.rollback_to_savepoint(&sp1, tx.cancellation()).await.unwrap();
    tx.commit(tx.cancellation()).await.unwrap();

    let c = reliablestore_core::CancellationToken::new();
    assert_eq!(backend_a.get(&"a".to_string(), &c).await.unwrap(), Some("1".to_string()));
    assert_eq!(backend_a.get(&"b".to_string(), &c).await.unwrap(), None);
    assert_eq!(backend_a.get(&"c".to_string(), &c).await.unwrap(), None);
}

/// Scenario 4: timeout drives rollback.
#[tokio::test]
async fn timeout_drives_rollback() {
    init_tracing();
    let backend_a = Arc::new(InMemoryRepository::<String, String>::new());
    let adapter_a = adapter("A", backend_a.clone());

    let tx = Transaction::new(TransactionOptions::default().with_timeout(Duration::from_millis(100)));
    tx.enlist_resource(adapter_a.clone()).unwrap();
    adapter_a.save(tx.id(), "a".into(), "1".into(), tx.cancellation()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    // By now the timer has already driven the rollback to completion
    // (state is RolledBack, not TimedOut), but commit() must still
    // surface the timeout, not an InvalidState for the resting state.
    let c = reliablestore_core::CancellationToken::new();
    let err = tx.commit(&c).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    assert_eq!(backend_a.get(&"a".to_string(), &c).await.unwrap(), None);
}

/// Scenario 5: auto-rollback on dispose, and idempotent rollback after.
#[tokio::test]
async fn auto_rollback_on_dispose() {
    init_tracing();
    let backend_a = Arc::new(InMemoryRepository::<String, String>::new());
    let adapter_a = adapter("A", backend_a.clone());

    {
        let tx = Transaction::new(TransactionOptions::default());
        tx.enlist_resource(adapter_a.clone()).unwrap();
        adapter_a.save(tx.id(), "a".into(), "1".into(), tx.cancellation()).await.unwrap();
        tx.close().await;

        // Rollback again: idempotent no-op.
        tx.rollback(tx.cancellation()).await.unwrap();
    }

    let c = reliablestore_core::CancellationToken::new();
    assert_eq!(backend_a.get(&"a".to_string(), &c).await.unwrap(), None);
}

/// Scenario 6: retry with exponential backoff succeeds on attempt 3.
#[tokio::test]
async fn retry_with_exponential_backoff_succeeds_eventually() {
    init_tracing();
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyResource {
        id: reliablestore_core::ResourceId,
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl reliablestore_core::TransactionalResource for FlakyResource {
        fn resource_id(&self) -> &reliablestore_core::ResourceId {
            &self.id
        }

        async fn prepare(
            &self,
            transaction_id: reliablestore_core::TransactionId,
            _cancel: &reliablestore_core::CancellationToken,
        ) -> reliablestore_core::Result<bool> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(Error::Timeout { transaction_id, elapsed: Duration::from_millis(1) })
            } else {
                Ok(true)
            }
        }

        async fn commit(&self, _: reliablestore_core::TransactionId, _: &reliablestore_core::CancellationToken) -> reliablestore_core::Result<()> {
            Ok(())
        }
        async fn rollback(&self, _: reliablestore_core::TransactionId, _: &reliablestore_core::CancellationToken) -> reliablestore_core::Result<()> {
            Ok(())
        }
        async fn create_savepoint(&self, _: reliablestore_core::TransactionId, _: &reliablestore_core::Savepoint, _: &reliablestore_core::CancellationToken) -> reliablestore_core::Result<()> {
            Ok(())
        }
        async fn rollback_to_savepoint(&self, _: reliablestore_core::TransactionId, _: &reliablestore_core::Savepoint, _: &reliablestore_core::CancellationToken) -> reliablestore_core::Result<()> {
            Ok(())
        }
        async fn discard_savepoint_data(&self, _: reliablestore_core::TransactionId, _: &reliablestore_core::Savepoint, _: &reliablestore_core::CancellationToken) -> reliablestore_core::Result<()> {
            Ok(())
        }
    }

    let resource = Arc::new(FlakyResource {
        id: "flaky".into(),
        attempts: AtomicU32::new(0),
    });

    let cancel = reliablestore_core::CancellationToken::new();
    let start = tokio::time::Instant::now();
    let result = factory::execute_with_retry(
        |tx| {
            let resource = resource.clone();
            async move {
                tx.enlist_resource(resource).unwrap();
                Ok(())
            }
        },
        3,
        Duration::from_millis(10),
        TransactionOptions::default(),
        &cancel,
    )
    .await;

    assert!(result.is_ok());
    assert!(resource.attempts.load(Ordering::SeqCst) >= 3);
    // Two backoff sleeps of >=10ms and >=20ms must have elapsed.
    assert!(start.elapsed() >= Duration::from_millis(30));
}

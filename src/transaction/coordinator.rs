use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::observability::get_metrics;
use crate::transaction::retry::RetryPolicy;
use crate::transaction::store::TransactionalStore;

/// Future returned by an operation run inside a transaction.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

/// Owns at most one open transaction for a single unit of work.
///
/// Not shared between requests: each request builds its own coordinator
/// around a shared store.
pub struct TransactionCoordinator<S: TransactionalStore> {
    store: Arc<S>,
    policy: RetryPolicy,
    active: Option<S::Tx>,
}

impl<S: TransactionalStore> TransactionCoordinator<S> {
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// The open transaction, for writes issued between `begin_transaction`
    /// and `commit_transaction`.
    pub fn transaction(&mut self) -> Option<&mut S::Tx> {
        self.active.as_mut()
    }

    /// Opens a transaction. A second call while one is open is a logged no-op.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        if self.active.is_some() {
            tracing::warn!("Transaction already active; ignoring nested begin");
            return Ok(());
        }

        self.active = Some(self.store.begin().await?);
        tracing::debug!("Transaction started");
        Ok(())
    }

    /// Commits the open transaction. The handle is released whether or not
    /// the commit succeeds.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match self.active.take() {
            Some(tx) => {
                self.store.commit(tx).await?;
                tracing::debug!("Transaction committed");
                Ok(())
            }
            None => {
                tracing::warn!("Commit requested with no active transaction");
                Ok(())
            }
        }
    }

    /// Rolls back the open transaction. The handle is released whether or not
    /// the rollback succeeds.
    pub async fn rollback_transaction(&mut self) -> Result<()> {
        match self.active.take() {
            Some(tx) => {
                self.store.rollback(tx).await?;
                get_metrics().record_transaction_rolled_back();
                tracing::debug!("Transaction rolled back");
                Ok(())
            }
            None => {
                tracing::warn!("Rollback requested with no active transaction");
                Ok(())
            }
        }
    }

    /// Runs `operation` between begin and commit, re-running the whole
    /// sequence when the store reports a transient fault.
    ///
    /// Any other error rolls the transaction back and is returned unchanged.
    /// `operation` may run more than once, so it must not have effects
    /// outside the transaction it is handed.
    pub async fn execute_in_transaction<T, F>(&mut self, mut operation: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut S::Tx) -> TxFuture<'t, T> + Send,
    {
        if self.active.is_some() {
            return Err(AppError::TransactionAlreadyActive);
        }

        let mut retries = 0u32;
        loop {
            match self.run_attempt(&mut operation).await {
                Ok(value) => {
                    get_metrics().record_transaction_committed(retries + 1);
                    return Ok(value);
                }
                Err(e) if self.store.is_transient(&e) => {
                    if !self.policy.allows_retry(retries) {
                        tracing::error!(attempts = retries + 1, error = %e, "Transient fault persisted; giving up");
                        return Err(AppError::RetriesExhausted {
                            attempts: retries + 1,
                            source: Box::new(e),
                        });
                    }

                    retries += 1;
                    let delay = self.policy.delay_for(retries);
                    get_metrics().record_transaction_retry();
                    tracing::warn!(
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient storage fault; retrying transaction"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_attempt<T, F>(&mut self, operation: &mut F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut S::Tx) -> TxFuture<'t, T> + Send,
    {
        self.begin_transaction().await?;

        let result = match self.active.as_mut() {
            Some(tx) => operation(tx).await,
            None => Err(AppError::Internal(anyhow::anyhow!(
                "Transaction missing after begin"
            ))),
        };

        match result {
            Ok(value) => {
                self.commit_transaction().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback_transaction().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed after operation error");
                }
                Err(e)
            }
        }
    }
}

impl<S: TransactionalStore> Drop for TransactionCoordinator<S> {
    fn drop(&mut self) {
        if self.active.take().is_some() {
            tracing::warn!("Coordinator dropped with an active transaction; releasing it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Writes are staged per transaction and only land in `committed` on commit.
    #[derive(Default)]
    struct StagedStore {
        committed: Mutex<HashMap<String, String>>,
        begins: AtomicU32,
        commits: AtomicU32,
        rollbacks: AtomicU32,
        fail_commits: AtomicU32,
    }

    #[derive(Default)]
    struct StagedTx {
        writes: Vec<(String, String)>,
    }

    impl StagedTx {
        fn put(&mut self, key: &str, value: &str) {
            self.writes.push((key.to_string(), value.to_string()));
        }
    }

    #[async_trait]
    impl TransactionalStore for StagedStore {
        type Tx = StagedTx;

        async fn begin(&self) -> Result<StagedTx> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(StagedTx::default())
        }

        async fn commit(&self, tx: StagedTx) -> Result<()> {
            if self.fail_commits.load(Ordering::SeqCst) > 0 {
                self.fail_commits.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            self.committed.lock().unwrap().extend(tx.writes);
            Ok(())
        }

        async fn rollback(&self, _tx: StagedTx) -> Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_transient(&self, error: &AppError) -> bool {
            matches!(error, AppError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_commit_makes_all_writes_visible() {
        let store = Arc::new(StagedStore::default());
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(0));

        let value = coordinator
            .execute_in_transaction(|tx| {
                Box::pin(async move {
                    tx.put("order:1", "pending");
                    tx.put("order_item:1", "sku-9");
                    Ok(7)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(store.committed.lock().unwrap().len(), 2);
        assert!(!coordinator.is_active());
    }

    #[tokio::test]
    async fn test_error_rolls_back_everything() {
        let store = Arc::new(StagedStore::default());
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(3));

        let result: Result<()> = coordinator
            .execute_in_transaction(|tx| {
                Box::pin(async move {
                    tx.put("a", "1");
                    tx.put("b", "2");
                    Err(AppError::Validation("third write rejected".into()))
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(store.committed.lock().unwrap().is_empty());
        assert_eq!(store.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(store.begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried() {
        let store = Arc::new(StagedStore::default());
        let calls = Arc::new(AtomicU32::new(0));
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(3));

        let result = coordinator
            .execute_in_transaction(|tx| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    tx.put("k", "v");
                    if n < 2 {
                        Err(AppError::Database(sqlx::Error::PoolTimedOut))
                    } else {
                        Ok(n)
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.rollbacks.load(Ordering::SeqCst), 2);
        assert_eq!(store.commits.load(Ordering::SeqCst), 1);
        assert_eq!(store.committed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_reruns_operation() {
        let store = Arc::new(StagedStore::default());
        store.fail_commits.store(1, Ordering::SeqCst);
        let calls = Arc::new(AtomicU32::new(0));
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(2));

        coordinator
            .execute_in_transaction(|tx| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tx.put("k", "v");
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.commits.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_active());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let store = Arc::new(StagedStore::default());
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(2));

        let result: Result<()> = coordinator
            .execute_in_transaction(|_tx| {
                Box::pin(async move { Err(AppError::Database(sqlx::Error::PoolTimedOut)) })
            })
            .await;

        match result {
            Err(AppError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(store.begins.load(Ordering::SeqCst), 3);
        assert!(store.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nested_begin_is_noop() {
        let store = Arc::new(StagedStore::default());
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(0));

        coordinator.begin_transaction().await.unwrap();
        coordinator.begin_transaction().await.unwrap();
        assert_eq!(store.begins.load(Ordering::SeqCst), 1);

        coordinator.transaction().unwrap().put("x", "1");
        coordinator.commit_transaction().await.unwrap();
        assert!(!coordinator.is_active());
        assert_eq!(store.committed.lock().unwrap().get("x").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_commit_and_rollback_without_transaction_are_noops() {
        let store = Arc::new(StagedStore::default());
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(0));

        coordinator.commit_transaction().await.unwrap();
        coordinator.rollback_transaction().await.unwrap();
        assert_eq!(store.commits.load(Ordering::SeqCst), 0);
        assert_eq!(store.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_refuses_while_manual_transaction_open() {
        let store = Arc::new(StagedStore::default());
        let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(0));
        coordinator.begin_transaction().await.unwrap();

        let result = coordinator
            .execute_in_transaction(|_tx| Box::pin(async move { Ok(()) }))
            .await;
        assert!(matches!(result, Err(AppError::TransactionAlreadyActive)));

        coordinator.rollback_transaction().await.unwrap();
        assert_eq!(store.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_active_transaction() {
        let store = Arc::new(StagedStore::default());
        {
            let mut coordinator = TransactionCoordinator::new(store.clone(), fast_policy(0));
            coordinator.begin_transaction().await.unwrap();
            coordinator.transaction().unwrap().put("lost", "write");
        }
        assert!(store.committed.lock().unwrap().is_empty());
        assert_eq!(store.commits.load(Ordering::SeqCst), 0);
    }
}

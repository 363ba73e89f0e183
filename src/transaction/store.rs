use async_trait::async_trait;

use crate::error::{AppError, Result};

/// Storage that can open, commit and roll back transactions.
///
/// It also decides which of its own errors are transient, which is what the
/// execution strategy retries on.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    fn is_transient(&self, error: &AppError) -> bool;
}

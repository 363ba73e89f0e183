use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{AppError, Result};
use crate::transaction::store::TransactionalStore;

/// Transactions on a Postgres pool.
#[derive(Clone)]
pub struct PgTransactionalStore {
    pool: PgPool,
}

impl PgTransactionalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionalStore for PgTransactionalStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx> {
        self.pool.begin().await.map_err(AppError::Database)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await.map_err(AppError::Database)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await.map_err(AppError::Database)
    }

    fn is_transient(&self, error: &AppError) -> bool {
        match error {
            AppError::Database(e) => is_transient_sqlx_error(e),
            _ => false,
        }
    }
}

/// Dropped connections, pool exhaustion, serialization failures and
/// deadlocks are worth retrying; everything else is not.
pub fn is_transient_sqlx_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| is_transient_sqlstate(&code))
            .unwrap_or(false),
        _ => false,
    }
}

pub fn is_transient_sqlstate(code: &str) -> bool {
    // Class 08: connection exception.
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P02" | "57P03")
}

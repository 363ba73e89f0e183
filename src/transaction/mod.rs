pub mod coordinator;
pub mod postgres;
pub mod retry;
pub mod store;

pub use coordinator::{TransactionCoordinator, TxFuture};
pub use postgres::{is_transient_sqlx_error, PgTransactionalStore};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::TransactionalStore;

pub mod claim;
pub mod handler;
pub mod key;
pub mod memory;
pub mod postgres;
pub mod reaper;
pub mod record;
pub mod response_cache;
pub mod store;

pub use claim::{ClaimOutcome, KeyClaimProtocol};
pub use handler::{
    Execution, IdempotencyHandler, IdempotencyHandlerConfig, IdempotencyMetrics, MetricsSnapshot,
};
pub use key::{validate_key, IDEMPOTENCY_KEY_HEADER, MAX_KEY_LENGTH};
pub use memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;
pub use reaper::{ExpiryReaper, IdempotencyCleanupJob};
pub use record::{IdempotencyRecord, IdempotencyStatus, RequestContext, DEFAULT_TTL_SECONDS};
pub use response_cache::{
    CachedResponse, KeyStatus, ResponseCache, ResponseLookup, IN_FLIGHT_STATUS, JSON_CONTENT_TYPE,
};
pub use store::{InsertOutcome, RecordStore};

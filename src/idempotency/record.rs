use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Records live for 24 hours unless configured otherwise.
pub const DEFAULT_TTL_SECONDS: i64 = 86_400;

/// Lifecycle state of an idempotency key.
///
/// Transitions only move forward: `New -> InProgress -> {Completed, Failed}`.
/// Any record past its `expires_at` is logically `Expired` regardless of the
/// stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    New,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl IdempotencyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IdempotencyStatus::Completed | IdempotencyStatus::Failed | IdempotencyStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::New => "NEW",
            IdempotencyStatus::InProgress => "IN_PROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
            IdempotencyStatus::Expired => "EXPIRED",
        }
    }
}

/// Audit attributes carried alongside a key. Never used for matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub principal: Option<String>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

/// One stored entry per client-supplied key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub response_payload: Option<Vec<u8>>,
    pub status_code: Option<i32>,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub principal: Option<String>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub error_message: Option<String>,
}

impl IdempotencyRecord {
    fn base(key: &str, status: IdempotencyStatus, context: &RequestContext, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            status,
            response_payload: None,
            status_code: None,
            content_type: None,
            created_at: now,
            last_accessed_at: None,
            expires_at: now + ttl,
            principal: context.principal.clone(),
            endpoint: context.endpoint.clone(),
            method: context.method.clone(),
            error_message: None,
        }
    }

    /// A freshly claimed key.
    pub fn in_progress(key: &str, context: &RequestContext, ttl: Duration) -> Self {
        Self::base(key, IdempotencyStatus::InProgress, context, ttl)
    }

    /// A key saved directly as completed, without a prior claim.
    pub fn completed(
        key: &str,
        payload: Vec<u8>,
        status_code: u16,
        content_type: &str,
        context: &RequestContext,
        ttl: Duration,
    ) -> Self {
        let mut record = Self::base(key, IdempotencyStatus::Completed, context, ttl);
        record.set_response(payload, status_code, content_type);
        record
    }

    /// Overwrites the stored outcome and moves the record to `Completed`.
    pub fn set_response(&mut self, payload: Vec<u8>, status_code: u16, content_type: &str) {
        self.status = IdempotencyStatus::Completed;
        self.response_payload = Some(payload);
        self.status_code = Some(i32::from(status_code));
        self.content_type = Some(content_type.to_string());
        self.error_message = None;
    }

    pub fn set_failed(&mut self, error_message: &str) {
        self.status = IdempotencyStatus::Failed;
        self.error_message = Some(error_message.to_string());
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the reaper should remove this record at `now`.
    pub fn is_reapable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_expired_at(now) || self.status == IdempotencyStatus::Expired
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == IdempotencyStatus::Failed
    }
}

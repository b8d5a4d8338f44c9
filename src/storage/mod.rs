pub mod memory;
pub mod redis;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted per-fingerprint reputation record.
/// Lives in the state store under `user_score:<fp>` with a 24h TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserScore {
    pub score: i32,
    pub last_seen: DateTime<Utc>,
    pub request_count: u64,
}

/// Short-term access record used by the behavioural analyzer.
/// Lives under `access_log:<fp>:<unix-seconds>` with a 1h TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentAccess {
    pub fingerprint: String,
    pub ip: String,
    pub user_agent: String,
    pub path: String,
    pub method: String,
    pub score: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store backend error: {0}")]
    Backend(String),

    #[error("state store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The shared coordination point between controllers. The Redis-compatible
/// backend is the production implementation; the in-memory backend serves
/// tests and single-process deployments. Both honour the same key layout
/// and TTL semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the persisted score, or `None` if the fingerprint has never
    /// been seen (or its record expired). The scorer substitutes the
    /// configured initial score.
    async fn get_user_score(&self, fingerprint: &str) -> StoreResult<Option<UserScore>>;

    /// Persist the score with a refreshed 24h TTL.
    async fn update_user_score(&self, fingerprint: &str, score: &UserScore) -> StoreResult<()>;

    /// Write the ban flag; the TTL encodes the remaining ban time.
    async fn ban_user(&self, fingerprint: &str, duration: Duration) -> StoreResult<()>;

    /// Delete the ban flag.
    async fn unban_user(&self, fingerprint: &str) -> StoreResult<()>;

    /// Remaining ban time, or `None` if not banned.
    async fn ban_status(&self, fingerprint: &str) -> StoreResult<Option<Duration>>;

    /// Atomically increment the per-window request counter. The first
    /// increment in a window arms the window TTL; later increments must
    /// not extend it.
    async fn increment_request_rate(&self, fingerprint: &str) -> StoreResult<()>;

    /// Current request count within the active rate window.
    async fn request_rate(&self, fingerprint: &str) -> StoreResult<u64>;

    /// Append a short-term access record (1h TTL).
    async fn log_access(&self, entry: &RecentAccess) -> StoreResult<()>;

    /// All short-term access records for the fingerprint within `window`.
    async fn recent_access(
        &self,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<RecentAccess>>;

    async fn add_whitelist(&self, fingerprint: &str, duration: Duration) -> StoreResult<()>;

    async fn remove_whitelist(&self, fingerprint: &str) -> StoreResult<()>;

    async fn is_whitelisted(&self, fingerprint: &str) -> StoreResult<bool>;
}

/// TTL applied to `user_score:` records.
pub const USER_SCORE_TTL: Duration = Duration::from_secs(24 * 3600);

/// TTL applied to `access_log:` records.
pub const ACCESS_LOG_TTL: Duration = Duration::from_secs(3600);

// Key layout shared by every backend. String keys so an operator can
// inspect the store with plain redis-cli.

pub(crate) fn score_key(fingerprint: &str) -> String {
    format!("user_score:{}", fingerprint)
}

pub(crate) fn ban_key(fingerprint: &str) -> String {
    format!("banned:{}", fingerprint)
}

pub(crate) fn whitelist_key(fingerprint: &str) -> String {
    format!("whitelist:{}", fingerprint)
}

pub(crate) fn rate_key(fingerprint: &str) -> String {
    format!("rate:{}", fingerprint)
}

pub(crate) fn access_log_key(fingerprint: &str, unix_secs: i64) -> String {
    format!("access_log:{}:{}", fingerprint, unix_secs)
}

pub(crate) fn access_log_pattern(fingerprint: &str) -> String {
    format!("access_log:{}:*", fingerprint)
}

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{
    access_log_key, access_log_pattern, ban_key, rate_key, score_key, whitelist_key,
    RecentAccess, StateStore, StoreError, StoreResult, UserScore, ACCESS_LOG_TTL,
    USER_SCORE_TTL,
};

/// Redis-compatible `StateStore` backend. All coordination between
/// controller processes goes through these keys; eviction is delegated
/// to server-side TTLs.
///
/// Every operation is bounded by a per-call timeout so a degraded store
/// slows a request by at most `op_timeout` before the pipeline falls
/// through to its neutral default.
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    rate_window: Duration,
}

impl RedisStore {
    /// Connect and ping. An unreachable store at startup is fatal, so
    /// this returns the raw error for `main` to bail on.
    pub async fn connect(
        url: &str,
        op_timeout: Duration,
        rate_window: Duration,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(url = url, "Connected to state store");

        Ok(Self {
            conn,
            op_timeout,
            rate_window,
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(StoreError::Backend(e.to_string())),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get_user_score(&self, fingerprint: &str) -> StoreResult<Option<UserScore>> {
        let key = score_key(fingerprint);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(conn.get(&key)).await?;

        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
        }
    }

    async fn update_user_score(&self, fingerprint: &str, score: &UserScore) -> StoreResult<()> {
        let key = score_key(fingerprint);
        let json = serde_json::to_string(score).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        self.bounded(conn.set_ex(&key, json, USER_SCORE_TTL.as_secs()))
            .await
    }

    async fn ban_user(&self, fingerprint: &str, duration: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(conn.set_ex(ban_key(fingerprint), "banned", duration.as_secs().max(1)))
            .await
    }

    async fn unban_user(&self, fingerprint: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(conn.del(ban_key(fingerprint))).await
    }

    async fn ban_status(&self, fingerprint: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        // TTL returns -2 for a missing key and -1 for no expiry; the ban
        // flag is always written with a TTL, so anything <= 0 means not
        // banned.
        let ttl: i64 = self.bounded(conn.ttl(ban_key(fingerprint))).await?;
        if ttl > 0 {
            Ok(Some(Duration::from_secs(ttl as u64)))
        } else {
            Ok(None)
        }
    }

    async fn increment_request_rate(&self, fingerprint: &str) -> StoreResult<()> {
        let key = rate_key(fingerprint);
        let window_secs = self.rate_window.as_secs() as i64;
        let mut conn = self.conn.clone();

        // One atomic pipeline. EXPIRE ... NX arms the window TTL on the
        // first increment only; later increments never extend it, so the
        // counter resets exactly one window after the burst began.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(&key)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(window_secs)
            .arg("NX")
            .ignore();

        let () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn request_rate(&self, fingerprint: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = self.bounded(conn.get(rate_key(fingerprint))).await?;
        Ok(count.unwrap_or(0))
    }

    async fn log_access(&self, entry: &RecentAccess) -> StoreResult<()> {
        let key = access_log_key(&entry.fingerprint, entry.timestamp.timestamp());
        let json = serde_json::to_string(entry).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        self.bounded(conn.set_ex(&key, json, ACCESS_LOG_TTL.as_secs()))
            .await
    }

    async fn recent_access(
        &self,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<RecentAccess>> {
        let pattern = access_log_pattern(fingerprint);
        let mut conn = self.conn.clone();

        let keys: Vec<String> = self
            .bounded(async {
                let mut keys = Vec::new();
                let mut iter = conn.scan_match::<_, String>(&pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok(keys)
            })
            .await?;

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = self.bounded(conn.mget(&keys)).await?;

        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());

        let mut records = Vec::new();
        for json in values.into_iter().flatten() {
            match serde_json::from_str::<RecentAccess>(&json) {
                Ok(record) if record.timestamp > cutoff => records.push(record),
                Ok(_) => {}
                Err(e) => debug!(fingerprint = fingerprint, error = %e, "Skipping corrupt access record"),
            }
        }
        Ok(records)
    }

    async fn add_whitelist(&self, fingerprint: &str, duration: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(conn.set_ex(
            whitelist_key(fingerprint),
            "whitelisted",
            duration.as_secs().max(1),
        ))
        .await
    }

    async fn remove_whitelist(&self, fingerprint: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(conn.del(whitelist_key(fingerprint))).await
    }

    async fn is_whitelisted(&self, fingerprint: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.bounded(conn.exists(whitelist_key(fingerprint))).await
    }
}

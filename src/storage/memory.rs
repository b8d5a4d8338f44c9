use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    RecentAccess, StateStore, StoreResult, UserScore, ACCESS_LOG_TTL, USER_SCORE_TTL,
};

/// In-process `StateStore` backend over concurrent maps with explicit
/// expiry instants. Entries are evicted lazily on read and swept by
/// `cleanup()` from a background task. Mirrors the Redis backend's key
/// semantics, including the fixed-window rate TTL.
pub struct MemoryStore {
    rate_window: Duration,
    scores: DashMap<String, (UserScore, Instant)>,
    bans: DashMap<String, Instant>,
    whitelist: DashMap<String, Instant>,
    rates: DashMap<String, RateWindow>,
    access: DashMap<String, Vec<(RecentAccess, Instant)>>,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u64,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new(rate_window: Duration) -> Self {
        Self {
            rate_window,
            scores: DashMap::new(),
            bans: DashMap::new(),
            whitelist: DashMap::new(),
            rates: DashMap::new(),
            access: DashMap::new(),
        }
    }

    /// Evict every expired entry. Run periodically; reads already ignore
    /// expired entries, so this only bounds memory.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.scores.retain(|_, (_, exp)| now < *exp);
        self.bans.retain(|_, exp| now < *exp);
        self.whitelist.retain(|_, exp| now < *exp);
        self.rates.retain(|_, w| now < w.expires_at);
        self.access.retain(|_, entries| {
            entries.retain(|(_, exp)| now < *exp);
            !entries.is_empty()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_user_score(&self, fingerprint: &str) -> StoreResult<Option<UserScore>> {
        if let Some(entry) = self.scores.get(fingerprint) {
            let (score, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                return Ok(Some(score.clone()));
            }
            drop(entry);
            self.scores.remove(fingerprint);
        }
        Ok(None)
    }

    async fn update_user_score(&self, fingerprint: &str, score: &UserScore) -> StoreResult<()> {
        self.scores.insert(
            fingerprint.to_string(),
            (score.clone(), Instant::now() + USER_SCORE_TTL),
        );
        Ok(())
    }

    async fn ban_user(&self, fingerprint: &str, duration: Duration) -> StoreResult<()> {
        self.bans
            .insert(fingerprint.to_string(), Instant::now() + duration);
        Ok(())
    }

    async fn unban_user(&self, fingerprint: &str) -> StoreResult<()> {
        self.bans.remove(fingerprint);
        Ok(())
    }

    async fn ban_status(&self, fingerprint: &str) -> StoreResult<Option<Duration>> {
        if let Some(entry) = self.bans.get(fingerprint) {
            let now = Instant::now();
            if now < *entry.value() {
                return Ok(Some(*entry.value() - now));
            }
            drop(entry);
            self.bans.remove(fingerprint);
        }
        Ok(None)
    }

    async fn increment_request_rate(&self, fingerprint: &str) -> StoreResult<()> {
        let now = Instant::now();
        let mut entry = self
            .rates
            .entry(fingerprint.to_string())
            .or_insert(RateWindow {
                count: 0,
                expires_at: now + self.rate_window,
            });
        if now >= entry.expires_at {
            // Window rolled over: restart the counter, arm a fresh TTL.
            entry.count = 1;
            entry.expires_at = now + self.rate_window;
        } else {
            entry.count += 1;
        }
        Ok(())
    }

    async fn request_rate(&self, fingerprint: &str) -> StoreResult<u64> {
        if let Some(entry) = self.rates.get(fingerprint) {
            if Instant::now() < entry.expires_at {
                return Ok(entry.count);
            }
        }
        Ok(0)
    }

    async fn log_access(&self, entry: &RecentAccess) -> StoreResult<()> {
        self.access
            .entry(entry.fingerprint.clone())
            .or_default()
            .push((entry.clone(), Instant::now() + ACCESS_LOG_TTL));
        Ok(())
    }

    async fn recent_access(
        &self,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<RecentAccess>> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let now = Instant::now();

        let mut out = Vec::new();
        if let Some(entries) = self.access.get(fingerprint) {
            for (record, expires_at) in entries.iter() {
                if now < *expires_at && record.timestamp > cutoff {
                    out.push(record.clone());
                }
            }
        }
        Ok(out)
    }

    async fn add_whitelist(&self, fingerprint: &str, duration: Duration) -> StoreResult<()> {
        self.whitelist
            .insert(fingerprint.to_string(), Instant::now() + duration);
        Ok(())
    }

    async fn remove_whitelist(&self, fingerprint: &str) -> StoreResult<()> {
        self.whitelist.remove(fingerprint);
        Ok(())
    }

    async fn is_whitelisted(&self, fingerprint: &str) -> StoreResult<bool> {
        if let Some(entry) = self.whitelist.get(fingerprint) {
            if Instant::now() < *entry.value() {
                return Ok(true);
            }
            drop(entry);
            self.whitelist.remove(fingerprint);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(fp: &str, path: &str) -> RecentAccess {
        RecentAccess {
            fingerprint: fp.to_string(),
            ip: "203.0.113.7".to_string(),
            user_agent: "test".to_string(),
            path: path.to_string(),
            method: "GET".to_string(),
            score: 100,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_score_roundtrip() {
        let store = MemoryStore::default();
        assert!(store.get_user_score("fp").await.unwrap().is_none());

        let score = UserScore {
            score: 87,
            last_seen: Utc::now(),
            request_count: 3,
        };
        store.update_user_score("fp", &score).await.unwrap();

        let loaded = store.get_user_score("fp").await.unwrap().unwrap();
        assert_eq!(loaded.score, 87);
        assert_eq!(loaded.request_count, 3);
    }

    #[tokio::test]
    async fn test_ban_roundtrip() {
        let store = MemoryStore::default();
        assert!(store.ban_status("fp").await.unwrap().is_none());

        store
            .ban_user("fp", Duration::from_secs(3600))
            .await
            .unwrap();
        let remaining = store.ban_status("fp").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(3600));
        assert!(remaining > Duration::from_secs(3590));

        store.unban_user("fp").await.unwrap();
        assert!(store.ban_status("fp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rate_counter_counts_within_window() {
        let store = MemoryStore::default();
        assert_eq!(store.request_rate("fp").await.unwrap(), 0);

        for _ in 0..5 {
            store.increment_request_rate("fp").await.unwrap();
        }
        assert_eq!(store.request_rate("fp").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_rate_window_ttl_not_extended_by_increments() {
        // A short window so the test can observe the rollover. The window
        // deadline is armed by the first increment only.
        let store = MemoryStore::new(Duration::from_millis(50));

        store.increment_request_rate("fp").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.increment_request_rate("fp").await.unwrap();
        assert_eq!(store.request_rate("fp").await.unwrap(), 2);

        // Past the original deadline: even though the second increment
        // happened 30ms in, the window still expires 50ms after the first.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.request_rate("fp").await.unwrap(), 0);

        // Next increment starts a fresh window at 1.
        store.increment_request_rate("fp").await.unwrap();
        assert_eq!(store.request_rate("fp").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_whitelist_real_deletion() {
        let store = MemoryStore::default();
        store
            .add_whitelist("fp", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.is_whitelisted("fp").await.unwrap());

        store.remove_whitelist("fp").await.unwrap();
        assert!(!store.is_whitelisted("fp").await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_access_window_filter() {
        let store = MemoryStore::default();
        store.log_access(&record("fp", "/a")).await.unwrap();
        store.log_access(&record("fp", "/b")).await.unwrap();

        let mut old = record("fp", "/stale");
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.log_access(&old).await.unwrap();

        let recent = store
            .recent_access("fp", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|r| r.path != "/stale"));
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired() {
        let store = MemoryStore::new(Duration::from_millis(10));
        store.increment_request_rate("fp").await.unwrap();
        store
            .ban_user("fp", Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.cleanup();

        assert_eq!(store.request_rate("fp").await.unwrap(), 0);
        assert!(store.ban_status("fp").await.unwrap().is_none());
    }
}

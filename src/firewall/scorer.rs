use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::defaults;
use crate::models::access::{AccessInfo, NetworkClass};
use crate::storage::{StateStore, StoreResult, UserScore};

use super::collector::detect_bot;

/// Floor below which no score can fall, regardless of penalties.
pub const MIN_SCORE: i32 = -50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "defaults::default_initial_score")]
    pub initial_score: i32,

    #[serde(default = "defaults::default_normal_access_bonus")]
    pub normal_access_bonus: i32,

    #[serde(default = "defaults::default_max_score")]
    pub max_score: i32,

    #[serde(default = "defaults::default_frequent_request_penalty")]
    pub frequent_request_penalty: i32,

    #[serde(default = "defaults::default_suspicious_ua_penalty")]
    pub suspicious_ua_penalty: i32,

    #[serde(default = "defaults::default_ban_threshold")]
    pub ban_threshold: i32,

    #[serde(default = "defaults::default_bot_penalty")]
    pub bot_penalty: i32,

    #[serde(default = "defaults::default_proxy_penalty")]
    pub proxy_penalty: i32,

    #[serde(default = "defaults::default_path_spam_penalty")]
    pub path_spam_penalty: i32,

    #[serde(default = "defaults::default_no_referer_penalty")]
    pub no_referer_penalty: i32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            initial_score: defaults::default_initial_score(),
            normal_access_bonus: defaults::default_normal_access_bonus(),
            max_score: defaults::default_max_score(),
            frequent_request_penalty: defaults::default_frequent_request_penalty(),
            suspicious_ua_penalty: defaults::default_suspicious_ua_penalty(),
            ban_threshold: defaults::default_ban_threshold(),
            bot_penalty: defaults::default_bot_penalty(),
            proxy_penalty: defaults::default_proxy_penalty(),
            path_spam_penalty: defaults::default_path_spam_penalty(),
            no_referer_penalty: defaults::default_no_referer_penalty(),
        }
    }
}

/// Advisory verdict derived from the score alone. The limiter has the
/// final say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreAction {
    Allow,
    Limit,
    Ban,
}

impl fmt::Display for ScoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreAction::Allow => write!(f, "allow"),
            ScoreAction::Limit => write!(f, "limit"),
            ScoreAction::Ban => write!(f, "ban"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreResult {
    pub old_score: i32,
    pub new_score: i32,
    pub change: i32,
    pub reasons: Vec<String>,
    pub action: ScoreAction,
    pub details: HashMap<String, i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ScoreAdjustment {
    points: i32,
    reason: String,
    category: &'static str,
}

/// Applies the rule table to the persisted per-fingerprint score on
/// every request: load, adjust, clamp, persist.
///
/// Reads-then-writes without CAS; concurrent requests for one
/// fingerprint may lose an update, which the clamp and the per-request
/// re-evaluation absorb.
pub struct Scorer {
    config: ScoringConfig,
    store: Arc<dyn StateStore>,
}

impl Scorer {
    pub fn new(config: ScoringConfig, store: Arc<dyn StateStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub async fn calculate(
        &self,
        fingerprint: &str,
        info: &AccessInfo,
    ) -> StoreResult<ScoreResult> {
        let mut user = self
            .store
            .get_user_score(fingerprint)
            .await?
            .unwrap_or(UserScore {
                score: self.config.initial_score,
                last_seen: Utc::now(),
                request_count: 0,
            });

        let old_score = user.score;
        let mut new_score = old_score;
        let mut reasons = Vec::new();
        let mut details = HashMap::new();

        for adjustment in self.evaluate(fingerprint, info).await {
            new_score += adjustment.points;
            reasons.push(adjustment.reason);
            details.insert(adjustment.category.to_string(), adjustment.points);
        }

        new_score = new_score.clamp(MIN_SCORE, self.config.max_score);

        user.score = new_score;
        user.last_seen = Utc::now();
        user.request_count += 1;
        self.store.update_user_score(fingerprint, &user).await?;

        let action = self.determine_action(new_score, info);

        debug!(
            fingerprint = fingerprint,
            old_score = old_score,
            new_score = new_score,
            action = %action,
            "Score updated"
        );

        Ok(ScoreResult {
            old_score,
            new_score,
            change: new_score - old_score,
            reasons,
            action,
            details,
            timestamp: Utc::now(),
        })
    }

    async fn evaluate(&self, fingerprint: &str, info: &AccessInfo) -> Vec<ScoreAdjustment> {
        let mut adjustments = Vec::new();

        if info.is_bot {
            adjustments.push(ScoreAdjustment {
                points: self.config.bot_penalty,
                reason: "bot user agent".to_string(),
                category: "bot_detection",
            });
        } else {
            adjustments.push(ScoreAdjustment {
                points: self.config.normal_access_bonus,
                reason: "normal access".to_string(),
                category: "normal_access",
            });
        }

        if is_suspicious_user_agent(&info.user_agent) {
            adjustments.push(ScoreAdjustment {
                points: self.config.suspicious_ua_penalty,
                reason: "suspicious user agent".to_string(),
                category: "suspicious_ua",
            });
        }

        if info.network == NetworkClass::Proxy {
            adjustments.push(ScoreAdjustment {
                points: self.config.proxy_penalty,
                reason: "proxied access".to_string(),
                category: "proxy_access",
            });
        }

        if is_suspicious_path(&info.path) {
            adjustments.push(ScoreAdjustment {
                points: self.config.path_spam_penalty,
                reason: "suspicious path".to_string(),
                category: "suspicious_path",
            });
        }

        if info.referer.is_empty() && info.method == "GET" {
            adjustments.push(ScoreAdjustment {
                points: self.config.no_referer_penalty,
                reason: "missing referer".to_string(),
                category: "no_referer",
            });
        }

        // Rate evidence is advisory; a store hiccup here must not sink
        // the whole calculation.
        match self.store.request_rate(fingerprint).await {
            Ok(rate) if rate > 50 => {
                let mut penalty = self.config.frequent_request_penalty;
                if rate > 100 {
                    penalty *= 2;
                }
                adjustments.push(ScoreAdjustment {
                    points: penalty,
                    reason: format!("frequent requests ({}/min)", rate),
                    category: "frequent_requests",
                });
            }
            Ok(_) => {}
            Err(e) => debug!(fingerprint = fingerprint, error = %e, "Rate lookup failed, skipping rule"),
        }

        adjustments
    }

    fn determine_action(&self, score: i32, info: &AccessInfo) -> ScoreAction {
        if score <= self.config.ban_threshold {
            return ScoreAction::Ban;
        }
        if score < 30 || info.is_bot {
            return ScoreAction::Limit;
        }
        if info.network == NetworkClass::Proxy && score < 70 {
            return ScoreAction::Limit;
        }
        ScoreAction::Allow
    }

    /// Write a fresh record at the configured initial score.
    pub async fn reset(&self, fingerprint: &str) -> StoreResult<()> {
        let fresh = UserScore {
            score: self.config.initial_score,
            last_seen: Utc::now(),
            request_count: 0,
        };
        self.store.update_user_score(fingerprint, &fresh).await
    }
}

/// The collector's bot predicate plus a version-token check: real
/// browsers carry `chrome/x.y`, `firefox/x.y`, `safari/x.y`, or
/// `version/x.y`.
fn is_suspicious_user_agent(user_agent: &str) -> bool {
    if detect_bot(user_agent) {
        return true;
    }

    let ua = user_agent.to_lowercase();
    let has_version = ua.contains("version/")
        || ua.contains("chrome/")
        || ua.contains("firefox/")
        || ua.contains("safari/");

    !has_version
}

fn is_suspicious_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }

    const SUSPICIOUS_TOKENS: &[&str] = &[
        "/admin",
        "/wp-admin",
        "/phpmyadmin",
        "/.env",
        "/.git",
        "/config",
        "/xmlrpc.php",
        "/wp-login.php",
        "../",
        "./",
        "<script",
        "javascript:",
        "union select",
        "drop table",
    ];

    let path = path.to_lowercase();
    if SUSPICIOUS_TOKENS.iter().any(|token| path.contains(token)) {
        return true;
    }

    let special_chars = path
        .chars()
        .filter(|c| matches!(c, '%' | '&' | '=' | '?'))
        .count();
    special_chars > 10
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::access::DeviceClass;
    use crate::storage::memory::MemoryStore;
    use std::collections::HashMap as StdHashMap;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn info(ua: &str, path: &str, referer: &str) -> AccessInfo {
        AccessInfo {
            client_ip: "203.0.113.7".to_string(),
            remote_addr: "203.0.113.7".to_string(),
            proxy_chain: Vec::new(),
            user_agent: ua.to_string(),
            referer: referer.to_string(),
            path: path.to_string(),
            method: "GET".to_string(),
            headers: StdHashMap::new(),
            proxy_headers: StdHashMap::new(),
            device: DeviceClass::Desktop,
            network: NetworkClass::Broadband,
            is_bot: detect_bot(ua),
            is_logged_in: false,
            is_behind_proxy: false,
            timestamp: Utc::now(),
        }
    }

    fn scorer(store: Arc<MemoryStore>) -> Scorer {
        Scorer::new(ScoringConfig::default(), store)
    }

    #[tokio::test]
    async fn test_normal_browser_first_request() {
        let store = Arc::new(MemoryStore::default());
        let s = scorer(store.clone());

        let result = s
            .calculate("fp", &info(CHROME_UA, "/", "https://example.com/"))
            .await
            .unwrap();

        // InitialScore + bonus, clamped at MaxScore.
        assert_eq!(result.new_score, 100);
        assert_eq!(result.action, ScoreAction::Allow);

        let persisted = store.get_user_score("fp").await.unwrap().unwrap();
        assert_eq!(persisted.score, 100);
        assert_eq!(persisted.request_count, 1);
    }

    #[tokio::test]
    async fn test_bot_penalties() {
        let store = Arc::new(MemoryStore::default());
        let s = scorer(store);

        let result = s
            .calculate("fp", &info("curl/8.4.0", "/", ""))
            .await
            .unwrap();

        // bot -15, suspicious UA -20, no referer -2.
        assert_eq!(result.new_score, 100 - 15 - 20 - 2);
        assert_eq!(result.action, ScoreAction::Limit);
        assert!(result.details.contains_key("bot_detection"));
        assert!(result.details.contains_key("suspicious_ua"));
    }

    #[tokio::test]
    async fn test_suspicious_path_penalty() {
        let store = Arc::new(MemoryStore::default());
        let s = scorer(store);

        let result = s
            .calculate("fp", &info(CHROME_UA, "/wp-admin/setup.php", "https://x/"))
            .await
            .unwrap();
        assert_eq!(*result.details.get("suspicious_path").unwrap(), -8);
    }

    #[tokio::test]
    async fn test_frequent_request_penalty_doubles() {
        let store = Arc::new(MemoryStore::default());
        let s = scorer(store.clone());

        for _ in 0..101 {
            store.increment_request_rate("fp").await.unwrap();
        }

        let result = s
            .calculate("fp", &info(CHROME_UA, "/", "https://x/"))
            .await
            .unwrap();
        assert_eq!(*result.details.get("frequent_requests").unwrap(), -20);
    }

    #[tokio::test]
    async fn test_score_clamped_at_floor() {
        let store = Arc::new(MemoryStore::default());
        let s = scorer(store.clone());

        store
            .update_user_score(
                "fp",
                &UserScore {
                    score: -45,
                    last_seen: Utc::now(),
                    request_count: 10,
                },
            )
            .await
            .unwrap();

        let result = s
            .calculate("fp", &info("curl/8.4.0", "/wp-admin", ""))
            .await
            .unwrap();
        assert_eq!(result.new_score, MIN_SCORE);
        assert_eq!(result.action, ScoreAction::Ban);
    }

    #[tokio::test]
    async fn test_proxy_network_limits_below_seventy() {
        let store = Arc::new(MemoryStore::default());
        let s = scorer(store.clone());

        store
            .update_user_score(
                "fp",
                &UserScore {
                    score: 60,
                    last_seen: Utc::now(),
                    request_count: 1,
                },
            )
            .await
            .unwrap();

        let mut proxied = info(CHROME_UA, "/", "https://x/");
        proxied.network = NetworkClass::Proxy;

        let result = s.calculate("fp", &proxied).await.unwrap();
        assert_eq!(result.action, ScoreAction::Limit);
        assert!(result.details.contains_key("proxy_access"));
    }

    #[tokio::test]
    async fn test_reset() {
        let store = Arc::new(MemoryStore::default());
        let s = scorer(store.clone());

        store
            .update_user_score(
                "fp",
                &UserScore {
                    score: -20,
                    last_seen: Utc::now(),
                    request_count: 99,
                },
            )
            .await
            .unwrap();

        s.reset("fp").await.unwrap();
        let fresh = store.get_user_score("fp").await.unwrap().unwrap();
        assert_eq!(fresh.score, 100);
        assert_eq!(fresh.request_count, 0);
    }

    #[test]
    fn test_suspicious_user_agent_predicate() {
        assert!(is_suspicious_user_agent(""));
        assert!(is_suspicious_user_agent("curl/8.4.0"));
        // Browser token but no version token.
        assert!(is_suspicious_user_agent("Mozilla/5.0 compatible-like agent"));
        assert!(!is_suspicious_user_agent(CHROME_UA));
    }

    #[test]
    fn test_suspicious_path_predicate() {
        assert!(is_suspicious_path("/wp-login.php"));
        assert!(is_suspicious_path("/search?q=<script>alert(1)</script>"));
        assert!(is_suspicious_path("/a?b=1&c=2&d=3&e=4&f=5&g=6&h=7&i=8&j=9&k=10&l=11"));
        assert!(!is_suspicious_path("/products/42"));
        assert!(!is_suspicious_path(""));
    }
}

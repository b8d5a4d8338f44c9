use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::defaults;
use crate::models::decision::{Action, Decision, RiskLevel};
use crate::storage::{StateStore, StoreResult};

use super::analyzer::{AnalysisResult, BehaviorKind, Severity};

/// Where a challenged client is sent. Solving the challenge is delegated.
pub const CHALLENGE_URL: &str = "/api/v1/challenge";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "defaults::default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    #[serde(default = "defaults::default_max_requests_per_window")]
    pub max_requests_per_window: u64,

    #[serde(default = "defaults::default_ban_duration_secs")]
    pub ban_duration_secs: u64,

    #[serde(default = "defaults::default_delay_response_ms")]
    pub delay_response_ms: u64,

    /// Score below which requests are slowed.
    #[serde(default = "defaults::default_warning_threshold")]
    pub warning_threshold: i32,

    /// Score below which a challenge is required.
    #[serde(default = "defaults::default_critical_threshold")]
    pub critical_threshold: i32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_secs: defaults::default_rate_limit_window_secs(),
            max_requests_per_window: defaults::default_max_requests_per_window(),
            ban_duration_secs: defaults::default_ban_duration_secs(),
            delay_response_ms: defaults::default_delay_response_ms(),
            warning_threshold: defaults::default_warning_threshold(),
            critical_threshold: defaults::default_critical_threshold(),
        }
    }
}

impl LimiterConfig {
    /// Startup and admin updates share this check; the reason string is
    /// surfaced verbatim in the admin 422 response.
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_limit_window_secs == 0 {
            return Err("rate_limit_window_secs must be positive".to_string());
        }
        if self.max_requests_per_window == 0 {
            return Err("max_requests_per_window must be positive".to_string());
        }
        if self.ban_duration_secs == 0 {
            return Err("ban_duration_secs must be positive".to_string());
        }
        if self.critical_threshold >= self.warning_threshold {
            return Err(
                "critical_threshold must be below warning_threshold".to_string(),
            );
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.delay_response_ms)
    }
}

/// The decision engine: composes ban state, request rate, score, and
/// behavioural analysis into one action per request, first match wins.
///
/// The config lives behind an `RwLock` so the admin surface can swap it
/// without a restart; readers always see a consistent snapshot.
pub struct Limiter {
    config: RwLock<LimiterConfig>,
    store: Arc<dyn StateStore>,
}

impl Limiter {
    pub fn new(config: LimiterConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config: RwLock::new(config),
            store,
        }
    }

    pub fn config(&self) -> LimiterConfig {
        self.config.read().clone()
    }

    /// Atomically replace the config after validation.
    pub fn update_config(&self, config: LimiterConfig) -> Result<(), String> {
        config.validate()?;
        *self.config.write() = config;
        info!("Limiter configuration replaced");
        Ok(())
    }

    /// Ordered, first-match evaluation: ban flag, request rate, score,
    /// behavioural analysis, default allow.
    pub async fn check(
        &self,
        fingerprint: &str,
        score: i32,
        analysis: Option<&AnalysisResult>,
    ) -> Decision {
        let config = self.config();

        // 1. Standing ban.
        match self.store.ban_status(fingerprint).await {
            Ok(Some(remaining)) => {
                return ban_decision("already banned", remaining);
            }
            Ok(None) => {}
            Err(e) => warn!(fingerprint = fingerprint, error = %e, "Ban lookup failed, skipping stage"),
        }

        // 2. Request rate.
        match self.store.request_rate(fingerprint).await {
            Ok(rate) if rate > config.max_requests_per_window => {
                return rate_limited(&config, rate);
            }
            Ok(_) => {}
            Err(e) => warn!(fingerprint = fingerprint, error = %e, "Rate lookup failed, skipping stage"),
        }

        // 3. Reputation score.
        if let Some(decision) = self.check_score(&config, fingerprint, score).await {
            return decision;
        }

        // 4. Behavioural analysis.
        if let Some(result) = analysis {
            if let Some(decision) = self.check_analysis(&config, fingerprint, result).await {
                return decision;
            }
        }

        // 5. Default.
        Decision::allow()
    }

    async fn check_score(
        &self,
        config: &LimiterConfig,
        fingerprint: &str,
        score: i32,
    ) -> Option<Decision> {
        if score <= 0 {
            return Some(
                self.ban(fingerprint, "score too low", config.ban_duration())
                    .await,
            );
        }

        if score < config.critical_threshold {
            return Some(Decision {
                action: Action::Challenge {
                    url: CHALLENGE_URL.to_string(),
                },
                reason: format!("score critically low: {}", score),
                status: 429,
                headers: vec![
                    ("X-Rate-Limit-Status".to_string(), "challenge_required".to_string()),
                    ("X-User-Score".to_string(), score.to_string()),
                ],
                message: "verification required".to_string(),
            });
        }

        if score < config.warning_threshold {
            return Some(Decision {
                action: Action::Delay(config.base_delay() * 2),
                reason: format!("score low: {}", score),
                status: 200,
                headers: vec![
                    ("X-Rate-Limit-Status".to_string(), "score_limited".to_string()),
                    ("X-User-Score".to_string(), score.to_string()),
                ],
                message: String::new(),
            });
        }

        None
    }

    async fn check_analysis(
        &self,
        config: &LimiterConfig,
        fingerprint: &str,
        result: &AnalysisResult,
    ) -> Option<Decision> {
        // Behaviour overrides outrank the risk bands: a confirmed
        // scanner gets banned even when its aggregate risk only reads
        // "high".
        for behavior in &result.behaviors {
            if behavior.kind == BehaviorKind::BotBehavior && behavior.confidence > 0.8 {
                return Some(
                    self.ban(fingerprint, "automated client behaviour", config.ban_duration())
                        .await,
                );
            }
            if behavior.kind == BehaviorKind::ScanningBehavior
                && behavior.severity == Severity::Danger
            {
                return Some(
                    self.ban(fingerprint, "malicious scanning", config.ban_duration() * 3)
                        .await,
                );
            }
        }

        match result.risk_level {
            RiskLevel::Critical => Some(
                self.ban(
                    fingerprint,
                    &format!("critical risk behaviour: {:.1}", result.risk_score),
                    config.ban_duration() * 2,
                )
                .await,
            ),
            RiskLevel::High => Some(Decision {
                action: Action::Challenge {
                    url: CHALLENGE_URL.to_string(),
                },
                reason: format!("high risk behaviour: {:.1}", result.risk_score),
                status: 429,
                headers: vec![
                    ("X-Rate-Limit-Status".to_string(), "high_risk".to_string()),
                    ("X-Risk-Score".to_string(), format!("{:.1}", result.risk_score)),
                ],
                message: "high-risk behaviour detected, verification required".to_string(),
            }),
            RiskLevel::Medium => Some(Decision {
                action: Action::Delay(config.base_delay() * 3),
                reason: format!("medium risk behaviour: {:.1}", result.risk_score),
                status: 200,
                headers: vec![
                    ("X-Rate-Limit-Status".to_string(), "medium_risk".to_string()),
                    ("X-Risk-Score".to_string(), format!("{:.1}", result.risk_score)),
                ],
                message: String::new(),
            }),
            RiskLevel::Low => None,
        }
    }

    /// Write the ban flag and build the matching decision. A store
    /// failure is logged; the request is still refused.
    async fn ban(&self, fingerprint: &str, reason: &str, duration: Duration) -> Decision {
        if let Err(e) = self.store.ban_user(fingerprint, duration).await {
            warn!(fingerprint = fingerprint, error = %e, "Failed to persist ban flag");
        } else {
            info!(
                fingerprint = fingerprint,
                reason = reason,
                duration_secs = duration.as_secs(),
                "Banned client"
            );
        }

        ban_decision(reason, duration)
    }

    // Manual operations, driven by the admin surface.

    pub async fn manual_ban(
        &self,
        fingerprint: &str,
        reason: &str,
        duration: Duration,
    ) -> StoreResult<()> {
        self.store.ban_user(fingerprint, duration).await?;
        info!(
            fingerprint = fingerprint,
            reason = reason,
            duration_secs = duration.as_secs(),
            "Manual ban"
        );
        Ok(())
    }

    pub async fn unban(&self, fingerprint: &str) -> StoreResult<()> {
        self.store.unban_user(fingerprint).await?;
        info!(fingerprint = fingerprint, "Manual unban");
        Ok(())
    }

    pub async fn ban_status(&self, fingerprint: &str) -> StoreResult<Option<Duration>> {
        self.store.ban_status(fingerprint).await
    }

    pub async fn add_to_whitelist(
        &self,
        fingerprint: &str,
        duration: Duration,
    ) -> StoreResult<()> {
        self.store.add_whitelist(fingerprint, duration).await
    }

    pub async fn remove_from_whitelist(&self, fingerprint: &str) -> StoreResult<()> {
        self.store.remove_whitelist(fingerprint).await
    }

    pub async fn is_whitelisted(&self, fingerprint: &str) -> StoreResult<bool> {
        self.store.is_whitelisted(fingerprint).await
    }
}

fn ban_decision(reason: &str, duration: Duration) -> Decision {
    Decision {
        action: Action::Ban {
            reason: reason.to_string(),
            duration,
        },
        reason: reason.to_string(),
        status: 403,
        headers: vec![
            ("X-Rate-Limit-Status".to_string(), "banned".to_string()),
            ("X-Ban-Reason".to_string(), reason.to_string()),
            ("Retry-After".to_string(), duration.as_secs().to_string()),
        ],
        message: format!("you are banned: {}", reason),
    }
}

fn rate_limited(config: &LimiterConfig, rate: u64) -> Decision {
    let mut delay = config.base_delay();
    if rate > config.max_requests_per_window * 2 {
        delay *= 3;
    } else if rate as f64 > config.max_requests_per_window as f64 * 1.5 {
        delay *= 2;
    }

    let reset = Utc::now().timestamp() + config.rate_limit_window_secs as i64;

    Decision {
        action: Action::Delay(delay),
        reason: format!(
            "request rate too high: {}/{}s",
            rate, config.rate_limit_window_secs
        ),
        status: 429,
        headers: vec![
            ("X-Rate-Limit-Status".to_string(), "rate_limited".to_string()),
            (
                "X-Rate-Limit-Limit".to_string(),
                config.max_requests_per_window.to_string(),
            ),
            ("X-Rate-Limit-Remaining".to_string(), "0".to_string()),
            ("X-Rate-Limit-Reset".to_string(), reset.to_string()),
            ("Retry-After".to_string(), delay.as_secs().to_string()),
        ],
        message: String::new(),
    }
}

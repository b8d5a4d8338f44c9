use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::models::access::AccessInfo;
use crate::models::decision::{Decision, RiskLevel};
use crate::storage::sqlite::AccessLogStore;
use crate::storage::{RecentAccess, StateStore};

use super::analyzer::Analyzer;
use super::collector::Collector;
use super::fingerprint::FingerprintGenerator;
use super::limiter::Limiter;
use super::scorer::Scorer;

/// Everything one request evaluation produced: the derived signals, the
/// identity, and the verdict. The server layer turns this into response
/// headers and, for blocking actions, a body.
pub struct Evaluation {
    pub info: AccessInfo,
    pub fingerprint: String,
    pub score: i32,
    pub risk_level: RiskLevel,
    pub decision: Decision,
}

/// Per-request orchestration: collect, fingerprint, whitelist gate, rate
/// increment, score, analyze, decide, log.
///
/// Internal failures never block traffic. Every store error degrades to
/// a neutral default and the request proceeds toward `allow`; only an
/// explicit ban flag fails closed.
pub struct FirewallPipeline {
    collector: Collector,
    fingerprinter: FingerprintGenerator,
    scorer: Arc<Scorer>,
    analyzer: Analyzer,
    limiter: Arc<Limiter>,
    store: Arc<dyn StateStore>,
    access_log: Arc<AccessLogStore>,
}

impl FirewallPipeline {
    pub fn new(
        collector: Collector,
        fingerprinter: FingerprintGenerator,
        scorer: Arc<Scorer>,
        analyzer: Analyzer,
        limiter: Arc<Limiter>,
        store: Arc<dyn StateStore>,
        access_log: Arc<AccessLogStore>,
    ) -> Self {
        Self {
            collector,
            fingerprinter,
            scorer,
            analyzer,
            limiter,
            store,
            access_log,
        }
    }

    pub async fn evaluate(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        remote_addr: &str,
    ) -> Evaluation {
        let info = self.collector.collect(method, path, headers, remote_addr);
        let fingerprint = self.fingerprinter.generate(&info);

        // Whitelisted fingerprints bypass the whole pipeline.
        match self.store.is_whitelisted(&fingerprint).await {
            Ok(true) => {
                debug!(fingerprint = %fingerprint, "Whitelisted, bypassing pipeline");
                let score = self.current_score(&fingerprint).await;
                return Evaluation {
                    info,
                    fingerprint,
                    score,
                    risk_level: RiskLevel::Low,
                    decision: Decision::allow(),
                };
            }
            Ok(false) => {}
            Err(e) => warn!(fingerprint = %fingerprint, error = %e, "Whitelist lookup failed"),
        }

        if let Err(e) = self.store.increment_request_rate(&fingerprint).await {
            warn!(fingerprint = %fingerprint, error = %e, "Rate increment failed");
        }

        let score = match self.scorer.calculate(&fingerprint, &info).await {
            Ok(result) => {
                debug!(
                    fingerprint = %fingerprint,
                    old = result.old_score,
                    new = result.new_score,
                    advisory = %result.action,
                    "Scored request"
                );
                result.new_score
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Scoring failed, score unchanged");
                self.current_score(&fingerprint).await
            }
        };

        let window = Duration::from_secs(self.analyzer.config().analysis_window_secs);
        let recent = match self.store.recent_access(&fingerprint, window).await {
            Ok(records) => records,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Recent-access lookup failed");
                Vec::new()
            }
        };

        let analysis = self.analyzer.analyze(&fingerprint, &recent);
        let decision = self
            .limiter
            .check(&fingerprint, score, Some(&analysis))
            .await;

        if decision.action.is_blocking() {
            info!(
                fingerprint = %fingerprint,
                ip = %info.client_ip,
                path = %info.path,
                action = %decision.action,
                reason = %decision.reason,
                "Request blocked"
            );
        }

        let entry = RecentAccess {
            fingerprint: fingerprint.clone(),
            ip: info.client_ip.clone(),
            user_agent: info.user_agent.clone(),
            path: info.path.clone(),
            method: info.method.clone(),
            score,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.log_access(&entry).await {
            warn!(fingerprint = %fingerprint, error = %e, "Short-term access log write failed");
        }

        if let Err(e) = self.access_log.append(
            &fingerprint,
            &info.client_ip,
            &info.user_agent,
            &info.path,
            &info.method,
            score,
            decision.action.as_str(),
            Utc::now(),
        ) {
            warn!(fingerprint = %fingerprint, error = %e, "Durable access log write failed");
        }

        Evaluation {
            info,
            fingerprint,
            score,
            risk_level: analysis.risk_level,
            decision,
        }
    }

    /// Last persisted score, or the configured initial score when there
    /// is none (or the store cannot answer).
    async fn current_score(&self, fingerprint: &str) -> i32 {
        match self.store.get_user_score(fingerprint).await {
            Ok(Some(user)) => user.score,
            _ => self.scorer.config().initial_score,
        }
    }
}

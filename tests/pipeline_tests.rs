use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use chrono::{TimeZone, Utc};
use tower::ServiceExt;

use palisade::admin_api::{self, routes::AppState};
use palisade::firewall::analyzer::{Analyzer, AnalyzerConfig};
use palisade::firewall::collector::{Collector, CollectorConfig};
use palisade::firewall::fingerprint::FingerprintGenerator;
use palisade::firewall::limiter::{Limiter, LimiterConfig};
use palisade::firewall::pipeline::FirewallPipeline;
use palisade::firewall::proxy_resolver::ProxyConfig;
use palisade::firewall::scorer::{Scorer, ScoringConfig};
use palisade::models::decision::{Action, RiskLevel};
use palisade::server::build_router;
use palisade::storage::memory::MemoryStore;
use palisade::storage::sqlite::{AccessLogQuery, AccessLogStore};
use palisade::storage::{RecentAccess, StateStore};

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

struct Harness {
    pipeline: Arc<FirewallPipeline>,
    limiter: Arc<Limiter>,
    scorer: Arc<Scorer>,
    store: Arc<MemoryStore>,
    access_log: Arc<AccessLogStore>,
}

fn harness_with_scoring(scoring: ScoringConfig) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let access_log = Arc::new(AccessLogStore::open_in_memory().unwrap());

    let collector = Collector::new(&CollectorConfig::default(), &ProxyConfig::default()).unwrap();
    let fingerprinter = FingerprintGenerator::new("test-salt");
    let scorer = Arc::new(Scorer::new(scoring, store.clone()));
    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let limiter = Arc::new(Limiter::new(LimiterConfig::default(), store.clone()));

    let pipeline = Arc::new(FirewallPipeline::new(
        collector,
        fingerprinter,
        scorer.clone(),
        analyzer,
        limiter.clone(),
        store.clone(),
        access_log.clone(),
    ));

    Harness {
        pipeline,
        limiter,
        scorer,
        store,
        access_log,
    }
}

fn harness() -> Harness {
    harness_with_scoring(ScoringConfig::default())
}

fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    map
}

fn browser_headers() -> HeaderMap {
    headers(&[
        ("User-Agent", CHROME_UA),
        ("Referer", "https://example.com/"),
        ("Accept", "text/html"),
        ("Accept-Language", "en-US,en;q=0.9"),
    ])
}

#[tokio::test]
async fn test_normal_browser_is_allowed() {
    let h = harness();

    let evaluation = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.7:50000")
        .await;

    assert_eq!(evaluation.decision.action, Action::Allow);
    assert_eq!(evaluation.decision.status, 200);
    assert_eq!(evaluation.score, 100);
    assert_eq!(evaluation.risk_level, RiskLevel::Low);
    assert_eq!(evaluation.info.client_ip, "203.0.113.7");
    assert!(evaluation
        .decision
        .headers
        .iter()
        .any(|(k, v)| k == "X-Rate-Limit-Status" && v == "ok"));

    // Both logs carry the request.
    let recent = h
        .store
        .recent_access(&evaluation.fingerprint, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);

    let durable = h.access_log.query(&AccessLogQuery::default()).unwrap();
    assert_eq!(durable.len(), 1);
    assert_eq!(durable[0].action, "allow");
}

#[tokio::test]
async fn test_cloudflare_chain_resolution() {
    let h = harness();

    let mut hdrs = browser_headers();
    hdrs.insert("CF-Connecting-IP", "198.51.100.9".parse().unwrap());
    hdrs.insert(
        "X-Forwarded-For",
        "198.51.100.9, 10.0.0.1".parse().unwrap(),
    );

    let evaluation = h
        .pipeline
        .evaluate(&Method::GET, "/", &hdrs, "10.0.0.1:443")
        .await;

    assert_eq!(evaluation.info.client_ip, "198.51.100.9");
    assert_eq!(
        evaluation.info.proxy_chain,
        vec!["198.51.100.9", "10.0.0.1"]
    );
    assert!(evaluation.info.is_behind_proxy);
}

#[tokio::test]
async fn test_scanner_gets_tripled_ban() {
    let h = harness();
    let scanner_headers = headers(&[
        ("User-Agent", "python-requests/2.31"),
        ("Referer", "https://example.org/"),
    ]);

    let first = h
        .pipeline
        .evaluate(
            &Method::GET,
            "/backup",
            &scanner_headers,
            "198.51.100.77:5000",
        )
        .await;
    assert_eq!(first.decision.action, Action::Allow);

    // The second probe sees the first in the recent window: every
    // distinct path is a scan target, so scanning lands at danger and
    // outranks the risk ladder.
    let second = h
        .pipeline
        .evaluate(
            &Method::GET,
            "/test",
            &scanner_headers,
            "198.51.100.77:5000",
        )
        .await;

    match &second.decision.action {
        Action::Ban { duration, .. } => {
            assert_eq!(*duration, Duration::from_secs(3 * 3600));
        }
        other => panic!("expected ban, got {:?}", other),
    }
    assert_eq!(second.decision.status, 403);
    assert!(second.risk_level >= RiskLevel::High);

    // Subsequent requests hit the standing ban.
    let third = h
        .pipeline
        .evaluate(&Method::GET, "/", &scanner_headers, "198.51.100.77:5000")
        .await;
    assert!(matches!(third.decision.action, Action::Ban { .. }));

    let remaining = h.limiter.ban_status(&second.fingerprint).await.unwrap();
    assert!(remaining.unwrap() > Duration::from_secs(2 * 3600));
}

#[tokio::test]
async fn test_rate_burst_delay_ladder() {
    // Frequent-request scoring is neutralised so this scenario isolates
    // the limiter's rate ladder; rate alone must never escalate to ban.
    let scoring = ScoringConfig {
        frequent_request_penalty: 0,
        ..ScoringConfig::default()
    };
    let h = harness_with_scoring(scoring);

    let hdrs = browser_headers();
    let mut actions = Vec::new();
    for i in 0..250 {
        let evaluation = h
            .pipeline
            .evaluate(
                &Method::GET,
                &format!("/item/{}", i),
                &hdrs,
                "203.0.113.8:40000",
            )
            .await;
        assert!(
            !matches!(evaluation.decision.action, Action::Ban { .. }),
            "rate alone must not ban"
        );
        actions.push(evaluation.decision.action);
    }

    let delay_at = |n: usize| match &actions[n - 1] {
        Action::Delay(d) => *d,
        other => panic!("expected delay at request {}, got {:?}", n, other),
    };

    assert_eq!(delay_at(101), Duration::from_millis(1000));
    assert_eq!(delay_at(150), Duration::from_millis(1000));
    assert_eq!(delay_at(151), Duration::from_millis(2000));
    assert_eq!(delay_at(201), Duration::from_millis(3000));
    assert_eq!(delay_at(250), Duration::from_millis(3000));
}

#[tokio::test]
async fn test_night_only_traffic_is_slowed() {
    let h = harness();

    // Learn the client's fingerprint, then backfill a night of traffic.
    let probe = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.9:40000")
        .await;
    assert_eq!(probe.decision.action, Action::Allow);

    for i in 0..20u32 {
        let entry = RecentAccess {
            fingerprint: probe.fingerprint.clone(),
            ip: "203.0.113.9".to_string(),
            user_agent: CHROME_UA.to_string(),
            path: "/news/feed".to_string(),
            method: "GET".to_string(),
            score: 100,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 3, i % 60, 0).unwrap(),
        };
        h.store.log_access(&entry).await.unwrap();
    }

    let evaluation = h
        .pipeline
        .evaluate(
            &Method::GET,
            "/news/feed",
            &browser_headers(),
            "203.0.113.9:40000",
        )
        .await;

    assert_eq!(evaluation.risk_level, RiskLevel::Medium);
    assert_eq!(
        evaluation.decision.action,
        Action::Delay(Duration::from_millis(3000))
    );
    assert_eq!(evaluation.decision.status, 200);
}

#[tokio::test]
async fn test_manual_ban_roundtrip() {
    let h = harness();

    let probe = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.10:40000")
        .await;
    assert_eq!(probe.decision.action, Action::Allow);
    let fp = probe.fingerprint.clone();

    h.limiter
        .manual_ban(&fp, "ops", Duration::from_secs(3600))
        .await
        .unwrap();
    let remaining = h.limiter.ban_status(&fp).await.unwrap().unwrap();
    assert!(remaining > Duration::from_secs(3590));

    // While banned, every request is refused regardless of score.
    let banned = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.10:40000")
        .await;
    assert!(matches!(banned.decision.action, Action::Ban { .. }));
    assert_eq!(banned.decision.status, 403);

    h.limiter.unban(&fp).await.unwrap();
    assert!(h.limiter.ban_status(&fp).await.unwrap().is_none());

    let after = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.10:40000")
        .await;
    assert_eq!(after.decision.action, Action::Allow);
}

#[tokio::test]
async fn test_whitelist_short_circuits_even_a_ban() {
    let h = harness();

    let probe = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.11:40000")
        .await;
    let fp = probe.fingerprint.clone();

    h.limiter
        .manual_ban(&fp, "ops", Duration::from_secs(3600))
        .await
        .unwrap();
    h.limiter
        .add_to_whitelist(&fp, Duration::from_secs(3600))
        .await
        .unwrap();

    let evaluation = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.11:40000")
        .await;
    assert_eq!(evaluation.decision.action, Action::Allow);

    // Removing the whitelist entry re-exposes the ban.
    h.limiter.remove_from_whitelist(&fp).await.unwrap();
    let evaluation = h
        .pipeline
        .evaluate(&Method::GET, "/", &browser_headers(), "203.0.113.11:40000")
        .await;
    assert!(matches!(evaluation.decision.action, Action::Ban { .. }));
}

fn admin_app(h: &Harness, api_key: &str) -> axum::Router {
    let state = AppState {
        limiter: h.limiter.clone(),
        scorer: h.scorer.clone(),
        store: h.store.clone(),
        access_log: h.access_log.clone(),
        start_time: std::time::Instant::now(),
    };
    build_router(
        h.pipeline.clone(),
        admin_api::admin_router(state, api_key.to_string()),
    )
}

#[tokio::test]
async fn test_middleware_emits_evaluation_headers() {
    let h = harness();
    let app = admin_app(&h, "test-key");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/")
                .header("User-Agent", CHROME_UA)
                .header("Referer", "https://example.com/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let fp = response
        .headers()
        .get("X-User-Fingerprint")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(fp.len(), 64);
    assert_eq!(response.headers().get("X-Risk-Level").unwrap(), "low");
    assert_eq!(response.headers().get("X-Rate-Limit-Status").unwrap(), "ok");
}

#[tokio::test]
async fn test_middleware_renders_ban_body() {
    let h = harness();

    // Learn the fingerprint the middleware will compute for this client,
    // then ban it.
    let probe = h
        .pipeline
        .evaluate(
            &Method::GET,
            "/",
            &headers(&[("User-Agent", CHROME_UA), ("Referer", "https://e.com/")]),
            "0.0.0.0:0",
        )
        .await;
    h.limiter
        .manual_ban(&probe.fingerprint, "ops", Duration::from_secs(3600))
        .await
        .unwrap();

    let app = admin_app(&h, "test-key");
    let response = app
        .oneshot(
            Request::builder()
                .uri("/")
                .header("User-Agent", CHROME_UA)
                .header("Referer", "https://e.com/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().contains_key("X-Ban-Reason"));

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "banned");
    // Remaining TTL, so slightly under the full hour.
    let retry_after = json["retry_after"].as_u64().unwrap();
    assert!(retry_after > 3500 && retry_after <= 3600);
    assert!(json["ban_duration"].as_str().unwrap().ends_with('s'));
}

#[tokio::test]
async fn test_admin_api_requires_key() {
    let h = harness();
    let app = admin_app(&h, "test-key");

    let denied = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .header("X-Palisade-Key", "test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_ban_lifecycle_over_http() {
    let h = harness();
    let app = admin_app(&h, "test-key");

    let created = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/bans")
                .header("X-Palisade-Key", "test-key")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{"fingerprint":"aabb","reason":"ops","duration_secs":600}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let status = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/bans/aabb")
                .header("X-Palisade-Key", "test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);
    let body = axum::body::to_bytes(status.into_body(), 64 * 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["banned"], true);

    let removed = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/bans/aabb")
                .header("X-Palisade-Key", "test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(removed.status(), StatusCode::OK);
    assert!(h.limiter.ban_status("aabb").await.unwrap().is_none());
}

#[tokio::test]
async fn test_admin_rejects_invalid_limiter_config() {
    let h = harness();
    let app = admin_app(&h, "test-key");

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/v1/config/limiter")
                .header("X-Palisade-Key", "test-key")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{"rate_limit_window_secs":60,"max_requests_per_window":0,
                        "ban_duration_secs":3600,"delay_response_ms":1000,
                        "warning_threshold":30,"critical_threshold":10}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

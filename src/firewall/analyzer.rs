use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::defaults;
use crate::models::decision::RiskLevel;
use crate::storage::RecentAccess;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Requests per minute-bin above which the client counts as bursting.
    #[serde(default = "defaults::default_suspicious_request_threshold")]
    pub suspicious_request_threshold: usize,

    /// Repeats of a single path above which path spam is considered.
    #[serde(default = "defaults::default_path_repeat_threshold")]
    pub path_repeat_threshold: usize,

    #[serde(default = "defaults::default_bot_detection_enabled")]
    pub bot_detection_enabled: bool,

    /// How far back the recent-access window reaches.
    #[serde(default = "defaults::default_analysis_window_secs")]
    pub analysis_window_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            suspicious_request_threshold: defaults::default_suspicious_request_threshold(),
            path_repeat_threshold: defaults::default_path_repeat_threshold(),
            bot_detection_enabled: defaults::default_bot_detection_enabled(),
            analysis_window_secs: defaults::default_analysis_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Danger,
}

impl Severity {
    /// Contribution weight in the risk score.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Info => 10.0,
            Severity::Warning => 30.0,
            Severity::Danger => 60.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Danger => write!(f, "danger"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    FrequentRequests,
    PathSpam,
    BotBehavior,
    ScanningBehavior,
    AbnormalTimePattern,
    SuspiciousUserAgent,
    MissingUserAgent,
}

impl fmt::Display for BehaviorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BehaviorKind::FrequentRequests => write!(f, "frequent_requests"),
            BehaviorKind::PathSpam => write!(f, "path_spam"),
            BehaviorKind::BotBehavior => write!(f, "bot_behavior"),
            BehaviorKind::ScanningBehavior => write!(f, "scanning_behavior"),
            BehaviorKind::AbnormalTimePattern => write!(f, "abnormal_time_pattern"),
            BehaviorKind::SuspiciousUserAgent => write!(f, "suspicious_user_agent"),
            BehaviorKind::MissingUserAgent => write!(f, "missing_user_agent"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectedBehavior {
    #[serde(rename = "type")]
    pub kind: BehaviorKind,
    pub severity: Severity,
    pub description: String,
    pub evidence: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatePoint {
    pub timestamp: DateTime<Utc>,
    pub count: usize,
}

/// Aggregations extracted from the recent-access window; the raw
/// material every detector works from.
#[derive(Debug, Clone, Default)]
pub struct AccessPattern {
    pub path_frequency: HashMap<String, usize>,
    pub time_distribution: HashMap<u32, usize>,
    pub user_agents: HashMap<String, usize>,
    pub methods: HashMap<String, usize>,
    pub request_rate: Vec<RatePoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisDetails {
    pub total_requests: usize,
    pub unique_paths: usize,
    pub unique_user_agents: usize,
    pub analysis_window_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub fingerprint: String,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub behaviors: Vec<DetectedBehavior>,
    pub recommendations: Vec<String>,
    pub details: AnalysisDetails,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    /// Neutral result: no history, no evidence, lowest band. Also the
    /// fallback when the store cannot produce the recent window.
    pub fn low(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            risk_level: RiskLevel::Low,
            risk_score: 0.0,
            behaviors: Vec::new(),
            recommendations: Vec::new(),
            details: AnalysisDetails {
                total_requests: 0,
                unique_paths: 0,
                unique_user_agents: 0,
                analysis_window_secs: 0,
            },
            timestamp: Utc::now(),
        }
    }
}

/// Uniform detector shape: each inspects the extracted pattern and emits
/// at most one behaviour.
type Detector = fn(&AnalyzerConfig, &AccessPattern) -> Option<DetectedBehavior>;

/// Scans a client's recent history for abuse patterns and bands the
/// outcome into a risk level. Detectors are registered as a list, not
/// hard-wired call sites.
pub struct Analyzer {
    config: AnalyzerConfig,
    detectors: Vec<Detector>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let detectors: Vec<Detector> = vec![
            detect_frequent_requests,
            detect_path_spam,
            detect_bot_behavior,
            detect_scanning_behavior,
            detect_abnormal_time_pattern,
            detect_user_agent_anomalies,
        ];
        Self { config, detectors }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn analyze(&self, fingerprint: &str, records: &[RecentAccess]) -> AnalysisResult {
        if records.is_empty() {
            return AnalysisResult::low(fingerprint);
        }

        let pattern = extract_pattern(records);

        let behaviors: Vec<DetectedBehavior> = self
            .detectors
            .iter()
            .filter_map(|detector| detector(&self.config, &pattern))
            .collect();

        let risk_score = risk_score(&behaviors, &pattern);
        let risk_level = RiskLevel::from_score(risk_score);
        let recommendations = recommendations(&behaviors, risk_score);

        AnalysisResult {
            fingerprint: fingerprint.to_string(),
            risk_level,
            risk_score,
            behaviors,
            recommendations,
            details: AnalysisDetails {
                total_requests: records.len(),
                unique_paths: pattern.path_frequency.len(),
                unique_user_agents: pattern.user_agents.len(),
                analysis_window_secs: self.config.analysis_window_secs,
            },
            timestamp: Utc::now(),
        }
    }
}

fn extract_pattern(records: &[RecentAccess]) -> AccessPattern {
    let mut pattern = AccessPattern::default();
    let mut minute_counts: HashMap<i64, usize> = HashMap::new();

    for record in records {
        *pattern
            .path_frequency
            .entry(record.path.clone())
            .or_insert(0) += 1;
        *pattern
            .time_distribution
            .entry(record.timestamp.hour())
            .or_insert(0) += 1;
        *pattern
            .user_agents
            .entry(record.user_agent.clone())
            .or_insert(0) += 1;
        if !record.method.is_empty() {
            *pattern.methods.entry(record.method.clone()).or_insert(0) += 1;
        }

        *minute_counts
            .entry(record.timestamp.timestamp() / 60)
            .or_insert(0) += 1;
    }

    let mut rate: Vec<RatePoint> = minute_counts
        .into_iter()
        .filter_map(|(minute, count)| {
            DateTime::from_timestamp(minute * 60, 0).map(|timestamp| RatePoint { timestamp, count })
        })
        .collect();
    rate.sort_by_key(|point| point.timestamp);
    pattern.request_rate = rate;

    pattern
}

fn detect_frequent_requests(
    config: &AnalyzerConfig,
    pattern: &AccessPattern,
) -> Option<DetectedBehavior> {
    let peak = pattern
        .request_rate
        .iter()
        .map(|point| point.count)
        .max()
        .unwrap_or(0);

    if peak <= config.suspicious_request_threshold {
        return None;
    }

    let peak_times: Vec<String> = pattern
        .request_rate
        .iter()
        .filter(|point| point.count > config.suspicious_request_threshold)
        .map(|point| point.timestamp.format("%H:%M").to_string())
        .collect();

    let severity = if peak > config.suspicious_request_threshold * 2 {
        Severity::Danger
    } else {
        Severity::Warning
    };

    Some(DetectedBehavior {
        kind: BehaviorKind::FrequentRequests,
        severity,
        description: format!("request burst, peak {} requests/minute", peak),
        evidence: vec![format!("peak minutes: {}", peak_times.join(", "))],
        confidence: 0.9,
    })
}

fn detect_path_spam(config: &AnalyzerConfig, pattern: &AccessPattern) -> Option<DetectedBehavior> {
    let total_requests: usize = pattern.path_frequency.values().sum();
    let repeated: Vec<String> = pattern
        .path_frequency
        .iter()
        .filter(|(_, count)| **count > config.path_repeat_threshold)
        .map(|(path, count)| format!("{} ({} hits)", path, count))
        .collect();

    if repeated.is_empty() || total_requests == 0 {
        return None;
    }

    let diversity = pattern.path_frequency.len() as f64 / total_requests as f64;
    let severity = if diversity < 0.05 {
        Severity::Danger
    } else if diversity < 0.1 {
        Severity::Warning
    } else {
        Severity::Info
    };

    Some(DetectedBehavior {
        kind: BehaviorKind::PathSpam,
        severity,
        description: format!("repeated path access, diversity {:.2}%", diversity * 100.0),
        evidence: repeated,
        confidence: 0.8,
    })
}

fn detect_bot_behavior(
    config: &AnalyzerConfig,
    pattern: &AccessPattern,
) -> Option<DetectedBehavior> {
    if !config.bot_detection_enabled {
        return None;
    }

    let mut indicators = Vec::new();
    let mut confidence: f64 = 0.0;

    for (ua, count) in &pattern.user_agents {
        if is_bot_user_agent(ua) {
            indicators.push(format!("bot user agent: {} ({} hits)", ua, count));
            confidence += 0.3;
        }
    }

    if has_regular_intervals(&pattern.request_rate) {
        indicators.push("metronomic request intervals".to_string());
        confidence += 0.2;
    }

    if lacks_static_resources(pattern) {
        indicators.push("no static resources fetched".to_string());
        confidence += 0.3;
    }

    if confidence <= 0.5 {
        return None;
    }

    let severity = if confidence > 0.8 {
        Severity::Danger
    } else {
        Severity::Warning
    };

    Some(DetectedBehavior {
        kind: BehaviorKind::BotBehavior,
        severity,
        description: "automated client behaviour".to_string(),
        evidence: indicators,
        // Contributions may sum past 1.0; the emitted value is capped.
        confidence: confidence.min(1.0),
    })
}

const SCAN_PATHS: &[&str] = &[
    "/admin",
    "/wp-admin",
    "/.env",
    "/.git",
    "/config",
    "/backup",
    "/test",
    "/api",
    "/phpmyadmin",
    "/xmlrpc.php",
];

fn detect_scanning_behavior(
    _config: &AnalyzerConfig,
    pattern: &AccessPattern,
) -> Option<DetectedBehavior> {
    let mut evidence = Vec::new();
    let mut matched = 0usize;

    for path in pattern.path_frequency.keys() {
        let lower = path.to_lowercase();
        if SCAN_PATHS.iter().any(|scan| lower.contains(scan)) {
            matched += 1;
            evidence.push(format!("probed path: {}", path));
        }
    }

    if matched == 0 || pattern.path_frequency.is_empty() {
        return None;
    }

    // Fraction of the client's distinct paths that hit scan targets: a
    // focused scanner approaches 1.0 even with a short path list.
    let confidence = matched as f64 / pattern.path_frequency.len() as f64;
    let severity = if confidence >= 0.5 {
        Severity::Danger
    } else if confidence >= 0.2 {
        Severity::Warning
    } else {
        Severity::Info
    };

    Some(DetectedBehavior {
        kind: BehaviorKind::ScanningBehavior,
        severity,
        description: format!("probed {} scan-target paths", matched),
        evidence,
        confidence,
    })
}

fn detect_abnormal_time_pattern(
    _config: &AnalyzerConfig,
    pattern: &AccessPattern,
) -> Option<DetectedBehavior> {
    let total: usize = pattern.time_distribution.values().sum();
    if total == 0 {
        return None;
    }

    let night: usize = (0..6)
        .map(|hour| pattern.time_distribution.get(&hour).copied().unwrap_or(0))
        .sum();
    let night_ratio = night as f64 / total as f64;

    if night_ratio > 0.5 && total > 10 {
        return Some(DetectedBehavior {
            kind: BehaviorKind::AbnormalTimePattern,
            severity: Severity::Warning,
            description: format!(
                "{:.1}% of requests between 00:00 and 06:00",
                night_ratio * 100.0
            ),
            evidence: vec![format!("night requests: {}", night)],
            confidence: 0.6,
        });
    }

    None
}

fn detect_user_agent_anomalies(
    _config: &AnalyzerConfig,
    pattern: &AccessPattern,
) -> Option<DetectedBehavior> {
    let has_any_ua = pattern.user_agents.keys().any(|ua| !ua.is_empty());
    if !has_any_ua {
        return Some(DetectedBehavior {
            kind: BehaviorKind::MissingUserAgent,
            severity: Severity::Danger,
            description: "no request carried a User-Agent".to_string(),
            evidence: vec![format!(
                "{} requests without a User-Agent",
                pattern.user_agents.values().sum::<usize>()
            )],
            confidence: 0.9,
        });
    }

    let mut suspicious = Vec::new();
    for (ua, count) in &pattern.user_agents {
        if ua.is_empty() {
            suspicious.push(format!("empty user agent ({} hits)", count));
        } else if ua.len() < 20 {
            suspicious.push(format!("short user agent: {} ({} hits)", ua, count));
        } else if is_bot_user_agent(ua) {
            suspicious.push(format!("bot user agent: {} ({} hits)", ua, count));
        }
    }

    if suspicious.is_empty() {
        return None;
    }

    Some(DetectedBehavior {
        kind: BehaviorKind::SuspiciousUserAgent,
        severity: Severity::Warning,
        description: "suspicious user agent strings".to_string(),
        evidence: suspicious,
        confidence: 0.7,
    })
}

fn is_bot_user_agent(user_agent: &str) -> bool {
    if user_agent.is_empty() {
        return true;
    }

    const BOT_KEYWORDS: &[&str] = &[
        "bot", "crawler", "spider", "scraper", "curl", "wget", "python", "java", "postman",
        "insomnia", "httpie",
    ];

    let ua = user_agent.to_lowercase();
    BOT_KEYWORDS.iter().any(|kw| ua.contains(kw))
}

/// Successive rate-bin intervals with near-zero variance and a short
/// mean read as machine-driven cadence.
fn has_regular_intervals(rate: &[RatePoint]) -> bool {
    if rate.len() < 3 {
        return false;
    }

    let intervals: Vec<f64> = rate
        .windows(2)
        .map(|pair| (pair[1].timestamp.timestamp() - pair[0].timestamp.timestamp()) as f64)
        .collect();

    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let variance = intervals
        .iter()
        .map(|interval| (interval - mean).powi(2))
        .sum::<f64>()
        / intervals.len() as f64;

    variance < 10.0 && mean < 120.0
}

fn lacks_static_resources(pattern: &AccessPattern) -> bool {
    const STATIC_SUFFIXES: &[&str] = &[".css", ".js", ".png", ".jpg", ".ico"];

    let has_static = pattern.path_frequency.keys().any(|path| {
        let lower = path.to_lowercase();
        STATIC_SUFFIXES.iter().any(|suffix| lower.contains(suffix))
    });

    !has_static && pattern.path_frequency.len() > 5
}

fn risk_score(behaviors: &[DetectedBehavior], pattern: &AccessPattern) -> f64 {
    let mut score: f64 = behaviors
        .iter()
        .map(|b| b.severity.weight() * b.confidence)
        .sum();

    if pattern.path_frequency.len() > 100 {
        score += 20.0;
    }
    if pattern.user_agents.len() > 10 {
        score += 15.0;
    }

    score.clamp(0.0, 100.0)
}

fn recommendations(behaviors: &[DetectedBehavior], risk_score: f64) -> Vec<String> {
    let mut out = Vec::new();

    let has = |kind: BehaviorKind| behaviors.iter().any(|b| b.kind == kind);

    if has(BehaviorKind::FrequentRequests) {
        out.push("enable request rate limiting".to_string());
    }
    if has(BehaviorKind::BotBehavior) {
        out.push("require a challenge for this client".to_string());
    }
    if has(BehaviorKind::ScanningBehavior) {
        out.push("ban this client, likely vulnerability scanning".to_string());
    }
    if has(BehaviorKind::PathSpam) {
        out.push("throttle access to the repeated paths".to_string());
    }

    if risk_score >= 80.0 {
        out.push("ban immediately".to_string());
    } else if risk_score >= 60.0 {
        out.push("apply strict limits".to_string());
    } else if risk_score >= 30.0 {
        out.push("increase monitoring".to_string());
    }

    if out.is_empty() {
        out.push("behaviour normal, keep monitoring".to_string());
    }

    out
}

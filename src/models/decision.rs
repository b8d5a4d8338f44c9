use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Enforcement action for one request. First-match evaluation in the
/// limiter produces exactly one of these per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Forward the request untouched.
    Allow,
    /// Sleep for the given duration, then forward.
    Delay(Duration),
    /// Stop the request and direct the client to a challenge endpoint.
    Challenge { url: String },
    /// Stop the request; the ban flag in the state store carries the TTL.
    Ban { reason: String, duration: Duration },
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Delay(_) => "delay",
            Action::Challenge { .. } => "challenge",
            Action::Ban { .. } => "ban",
        }
    }

    /// Whether this action terminates the request instead of forwarding it.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Action::Challenge { .. } | Action::Ban { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The limiter's verdict plus everything needed to shape the response.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub message: String,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            action: Action::Allow,
            reason: "normal access".to_string(),
            status: 200,
            headers: vec![("X-Rate-Limit-Status".to_string(), "ok".to_string())],
            message: String::new(),
        }
    }
}

/// Coarse banding of the analyzer's 0-100 risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Band a risk score: <30 low, <60 medium, <80 high, else critical.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            RiskLevel::Critical
        } else if score >= 60.0 {
            RiskLevel::High
        } else if score >= 30.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Render a duration the way the ban response body documents it:
/// `1h0m0s`, `1m30s`, `45s`. Hours are the largest unit.
pub fn format_go_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        assert_eq!(Action::Allow.as_str(), "allow");
        assert_eq!(Action::Delay(Duration::from_secs(1)).as_str(), "delay");
        assert!(Action::Ban {
            reason: "x".into(),
            duration: Duration::from_secs(1)
        }
        .is_blocking());
        assert!(!Action::Delay(Duration::from_secs(1)).is_blocking());
    }

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(29.9), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100.0), RiskLevel::Critical);
    }

    #[test]
    fn test_go_duration_format() {
        assert_eq!(format_go_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_go_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_go_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_go_duration(Duration::from_secs(7322)), "2h2m2s");
        assert_eq!(format_go_duration(Duration::from_secs(0)), "0s");
    }
}

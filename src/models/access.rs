use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse device classification derived from the User-Agent string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    Bot,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Desktop => write!(f, "desktop"),
            DeviceClass::Mobile => write!(f, "mobile"),
            DeviceClass::Tablet => write!(f, "tablet"),
            DeviceClass::Bot => write!(f, "bot"),
        }
    }
}

/// Network classification of the resolved client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Broadband,
    Mobile,
    Proxy,
    Private,
    Unknown,
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkClass::Broadband => write!(f, "broadband"),
            NetworkClass::Mobile => write!(f, "mobile"),
            NetworkClass::Proxy => write!(f, "proxy"),
            NetworkClass::Private => write!(f, "private"),
            NetworkClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// Everything the firewall derives from a single incoming request.
/// Built per request by the collector; never persisted.
#[derive(Debug, Clone)]
pub struct AccessInfo {
    /// Resolved client IP after walking the trusted-proxy chain.
    /// Kept as a string: the best-effort fallback is the raw peer
    /// address, which may not parse as an IP.
    pub client_ip: String,

    /// Raw transport-level remote address, before proxy resolution.
    pub remote_addr: String,

    /// Ordered proxy chain extracted from forwarding headers.
    pub proxy_chain: Vec<String>,

    pub user_agent: String,
    pub referer: String,
    pub path: String,
    pub method: String,

    /// Stability-relevant request headers (fixed whitelist).
    pub headers: HashMap<String, String>,

    /// Every proxy-signalling header present on the request.
    pub proxy_headers: HashMap<String, String>,

    pub device: DeviceClass,
    pub network: NetworkClass,

    pub is_bot: bool,
    pub is_logged_in: bool,
    pub is_behind_proxy: bool,

    pub timestamp: DateTime<Utc>,
}

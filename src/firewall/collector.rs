use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, Method};
use chrono::Utc;
use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::Deserialize;

use crate::models::access::{AccessInfo, DeviceClass, NetworkClass};

use super::proxy_resolver::{is_private_ip, ProxyConfig, ProxyResolver};

/// Request headers retained on `AccessInfo` (stability-relevant set).
const RETAINED_HEADERS: &[&str] = &[
    "Accept",
    "Accept-Language",
    "Accept-Encoding",
    "Connection",
    "Upgrade-Insecure-Requests",
    "Sec-Ch-Ua",
    "Sec-Ch-Ua-Mobile",
    "Sec-Ch-Ua-Platform",
    "DNT",
    "Sec-Fetch-Dest",
    "Sec-Fetch-Mode",
    "Sec-Fetch-Site",
];

/// Every proxy-signalling header worth capturing.
const PROXY_HEADERS: &[&str] = &[
    "X-Forwarded-For",
    "X-Real-IP",
    "X-Forwarded-Proto",
    "X-Forwarded-Host",
    "X-Forwarded-Port",
    "X-Forwarded-Server",
    "X-Client-IP",
    "CF-Connecting-IP",
    "True-Client-IP",
    "X-Cluster-Client-IP",
    "Forwarded",
    "Via",
    "X-Originating-IP",
    "X-Remote-IP",
    "X-Remote-Addr",
];

/// Headers whose mere presence marks the request as proxied.
const PROXY_INDICATORS: &[&str] = &[
    "X-Forwarded-For",
    "X-Real-IP",
    "X-Forwarded-Proto",
    "CF-Connecting-IP",
    "True-Client-IP",
    "Via",
    "Forwarded",
];

static BOT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)(bot|crawler|spider|scraper|curl|wget|python|java|go-http)",
        r"(?i)(googlebot|bingbot|slurp|duckduckbot|baiduspider|yandexbot)",
        r"(?i)(facebookexternalhit|twitterbot|linkedinbot|whatsapp)",
        r"(?i)(postman|insomnia|httpie|apache-httpclient)",
    ])
    .unwrap()
});

static MOBILE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)(mobile|android|iphone|ipad|ipod|blackberry|windows phone)",
        r"(?i)(opera mini|opera mobi|samsung|nokia|huawei|xiaomi)",
    ])
    .unwrap()
});

const BROWSER_KEYWORDS: &[&str] = &["chrome", "firefox", "safari", "edge", "opera"];
const PROGRAMMING_KEYWORDS: &[&str] = &["python", "java", "node", "php", "ruby", "go", "rust"];
const LOGIN_COOKIES: &[&str] = &["session", "token", "auth", "login", "user_id", "jwt"];

/// IP-range knobs for the network classifier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectorConfig {
    /// CIDRs treated as known proxy/VPN egress ranges.
    #[serde(default)]
    pub proxy_ranges: Vec<String>,

    /// CIDRs belonging to mobile carriers.
    #[serde(default)]
    pub mobile_ranges: Vec<String>,
}

/// Turns a raw request into an `AccessInfo`. Pure apart from the clock.
pub struct Collector {
    resolver: ProxyResolver,
    proxy_nets: Vec<IpNet>,
    mobile_nets: Vec<IpNet>,
}

impl Collector {
    pub fn new(config: &CollectorConfig, proxy_config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            resolver: ProxyResolver::new(proxy_config)?,
            proxy_nets: parse_ranges(&config.proxy_ranges).context("invalid proxy range")?,
            mobile_nets: parse_ranges(&config.mobile_ranges).context("invalid mobile range")?,
        })
    }

    pub fn collect(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        remote_addr: &str,
    ) -> AccessInfo {
        let (client_ip, proxy_chain) = self.resolver.resolve(remote_addr, headers);

        let user_agent = header_str(headers, "user-agent").unwrap_or_default();
        let referer = header_str(headers, "referer").unwrap_or_default();

        let device = self.classify_device(&user_agent);
        let network = self.classify_network(&client_ip);

        AccessInfo {
            client_ip,
            remote_addr: strip_addr_port(remote_addr),
            proxy_chain,
            is_bot: detect_bot(&user_agent),
            is_logged_in: detect_login(headers),
            is_behind_proxy: detect_proxy(headers),
            user_agent,
            referer,
            path: path.to_string(),
            method: method.as_str().to_string(),
            headers: retained_headers(headers),
            proxy_headers: captured_proxy_headers(headers),
            device,
            network,
            timestamp: Utc::now(),
        }
    }

    /// Dispatch order: mobile (then tablet refinement), bot, desktop.
    fn classify_device(&self, user_agent: &str) -> DeviceClass {
        let ua = user_agent.to_lowercase();

        if MOBILE_PATTERNS.is_match(&ua) {
            if ua.contains("tablet") || ua.contains("ipad") {
                return DeviceClass::Tablet;
            }
            return DeviceClass::Mobile;
        }

        if BOT_PATTERNS.is_match(&ua) {
            return DeviceClass::Bot;
        }

        DeviceClass::Desktop
    }

    fn classify_network(&self, client_ip: &str) -> NetworkClass {
        let Ok(ip) = client_ip.parse::<IpAddr>() else {
            return NetworkClass::Unknown;
        };

        if is_private_ip(ip) {
            return NetworkClass::Private;
        }
        if self.proxy_nets.iter().any(|net| net.contains(&ip)) {
            return NetworkClass::Proxy;
        }
        if self.mobile_nets.iter().any(|net| net.contains(&ip)) {
            return NetworkClass::Mobile;
        }

        NetworkClass::Broadband
    }
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<IpNet>> {
    ranges
        .iter()
        .map(|cidr| {
            cidr.parse::<IpNet>()
                .with_context(|| format!("invalid CIDR: {}", cidr))
        })
        .collect()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn retained_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in RETAINED_HEADERS {
        if let Some(value) = header_str(headers, name) {
            out.insert(name.to_string(), value);
        }
    }
    out
}

fn captured_proxy_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in PROXY_HEADERS {
        if let Some(value) = header_str(headers, name) {
            out.insert(name.to_string(), value);
        }
    }
    out
}

fn detect_proxy(headers: &HeaderMap) -> bool {
    for name in PROXY_INDICATORS {
        if headers.contains_key(*name) {
            return true;
        }
    }

    if let Some(conn) = header_str(headers, "connection") {
        if conn.to_lowercase().contains("proxy") {
            return true;
        }
    }

    false
}

/// The 4.1 bot predicate: no UA, short UA, bot-pattern match, or a
/// programming-language token with no browser token.
pub fn detect_bot(user_agent: &str) -> bool {
    if user_agent.is_empty() {
        return true;
    }

    let ua = user_agent.to_lowercase();
    if BOT_PATTERNS.is_match(&ua) {
        return true;
    }

    if user_agent.len() < 10 {
        return true;
    }

    let has_browser = BROWSER_KEYWORDS.iter().any(|kw| ua.contains(kw));
    if !has_browser {
        return PROGRAMMING_KEYWORDS.iter().any(|kw| ua.contains(kw));
    }

    false
}

fn detect_login(headers: &HeaderMap) -> bool {
    if headers.contains_key("authorization") {
        return true;
    }

    let Some(cookies) = header_str(headers, "cookie") else {
        return false;
    };

    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if !value.is_empty() && LOGIN_COOKIES.contains(&name.trim()) {
                return true;
            }
        }
    }

    false
}

fn strip_addr_port(addr: &str) -> String {
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => sock.ip().to_string(),
        Err(_) => addr.to_string(),
    }
}

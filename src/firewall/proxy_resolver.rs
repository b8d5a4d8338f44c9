use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use ipnet::IpNet;
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::config::defaults;

/// Private / loopback / link-local ranges, v4 and v6.
static PRIVATE_RANGES: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "::1/128",
        "fc00::/7",
    ]
    .iter()
    .map(|cidr| cidr.parse().unwrap())
    .collect()
});

pub fn is_private_ip(ip: IpAddr) -> bool {
    PRIVATE_RANGES.iter().any(|net| net.contains(&ip))
}

/// Which peers may speak for their clients, and through which headers.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// CIDRs (or bare IPs) whose direct connections may supply
    /// forwarded-for headers.
    #[serde(default = "defaults::default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,

    /// Header names that may carry client IPs.
    #[serde(default = "defaults::default_trusted_headers")]
    pub trusted_headers: Vec<String>,

    /// Header name -> priority; higher wins. Unlisted trusted headers
    /// get priority 50.
    #[serde(default = "defaults::default_header_priority")]
    pub header_priority: HashMap<String, i32>,

    /// Skip private-range IPs when falling back to "first valid in chain".
    #[serde(default = "defaults::default_skip_private_ranges")]
    pub skip_private_ranges: bool,

    /// Upper bound on the retained proxy-chain length.
    #[serde(default = "defaults::default_max_proxy_depth")]
    pub max_proxy_depth: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: defaults::default_trusted_proxies(),
            trusted_headers: defaults::default_trusted_headers(),
            header_priority: defaults::default_header_priority(),
            skip_private_ranges: defaults::default_skip_private_ranges(),
            max_proxy_depth: defaults::default_max_proxy_depth(),
        }
    }
}

/// Walks the trusted-proxy chain of a request to a (real client IP,
/// proxy chain) pair. Deterministic and side-effect-free.
pub struct ProxyResolver {
    trusted_nets: Vec<IpNet>,
    headers_by_priority: Vec<String>,
    skip_private_ranges: bool,
    max_proxy_depth: usize,
}

impl ProxyResolver {
    /// Build the resolver. An unparsable trusted-proxy entry is a
    /// configuration error (fatal at startup).
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut trusted_nets = Vec::with_capacity(config.trusted_proxies.len());
        for entry in &config.trusted_proxies {
            let net = parse_cidr_or_ip(entry)
                .with_context(|| format!("invalid trusted proxy entry: {}", entry))?;
            trusted_nets.push(net);
        }

        // Sort the trusted headers by configured priority, descending;
        // unlisted headers default to 50.
        let mut headers: Vec<(String, i32)> = config
            .trusted_headers
            .iter()
            .map(|h| {
                let priority = config
                    .header_priority
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(h))
                    .map(|(_, p)| *p)
                    .unwrap_or(50);
                (h.clone(), priority)
            })
            .collect();
        headers.sort_by(|a, b| b.1.cmp(&a.1));

        Ok(Self {
            trusted_nets,
            headers_by_priority: headers.into_iter().map(|(h, _)| h).collect(),
            skip_private_ranges: config.skip_private_ranges,
            max_proxy_depth: config.max_proxy_depth,
        })
    }

    pub fn is_trusted_proxy(&self, ip_str: &str) -> bool {
        match ip_str.parse::<IpAddr>() {
            Ok(ip) => self.trusted_nets.iter().any(|net| net.contains(&ip)),
            Err(_) => false,
        }
    }

    /// Resolve the real client IP and the proxy chain.
    ///
    /// If the direct peer is not a trusted proxy its forwarding headers
    /// are ignored entirely: the peer IS the client and the chain is
    /// empty. Otherwise the chain is assembled from every trusted header
    /// in priority order (de-duplicated, first-seen order) and scanned
    /// right-to-left for the first IP that is not itself a trusted proxy.
    pub fn resolve(&self, remote_addr: &str, headers: &HeaderMap) -> (String, Vec<String>) {
        let peer = strip_port(remote_addr);

        if !self.is_trusted_proxy(&peer) {
            return (peer, Vec::new());
        }

        let mut chain: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for header in &self.headers_by_priority {
            let Some(value) = headers.get(header.as_str()).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            for ip in parse_header_values(header, value) {
                if seen.insert(ip.clone()) {
                    chain.push(ip);
                }
            }
        }

        let mut real_ip = chain
            .iter()
            .rev()
            .find(|candidate| {
                candidate.parse::<IpAddr>().is_ok() && !self.is_trusted_proxy(candidate)
            })
            .cloned();

        // Nothing non-trusted in the chain: fall back to the first valid
        // IP, skipping private ranges when configured to.
        if real_ip.is_none() {
            real_ip = chain
                .iter()
                .find(|candidate| match candidate.parse::<IpAddr>() {
                    Ok(ip) => !self.skip_private_ranges || !is_private_ip(ip),
                    Err(_) => false,
                })
                .cloned();
        }

        chain.truncate(self.max_proxy_depth);

        (real_ip.unwrap_or(peer), chain)
    }
}

fn parse_cidr_or_ip(entry: &str) -> Result<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    // Bare IP: treat as a host route.
    let ip: IpAddr = entry.parse()?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    Ok(IpNet::new(ip, prefix)?)
}

/// Strip a trailing `:port` when unambiguous. Bracketed IPv6 forms are
/// unwrapped; a bare IPv6 address (multiple colons, no brackets) is left
/// alone.
fn strip_port(addr: &str) -> String {
    let addr = addr.trim();

    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }

    if let Some(colon) = addr.rfind(':') {
        if !addr[..colon].contains(':') {
            return addr[..colon].to_string();
        }
    }

    addr.to_string()
}

/// Parse the IPs carried by one forwarding header.
fn parse_header_values(header: &str, value: &str) -> Vec<String> {
    let mut ips = Vec::new();

    if header.eq_ignore_ascii_case("x-forwarded-for") {
        // X-Forwarded-For: client, proxy1, proxy2
        for part in value.split(',') {
            let ip = part.trim();
            if !ip.is_empty() {
                ips.push(ip.to_string());
            }
        }
    } else if header.eq_ignore_ascii_case("forwarded") {
        // RFC 7239: Forwarded: for=192.0.2.60;proto=http;by=203.0.113.43
        for element in value.split(',') {
            for param in element.split(';') {
                let param = param.trim();
                if let Some(raw) = param
                    .strip_prefix("for=")
                    .or_else(|| param.strip_prefix("For="))
                    .or_else(|| param.strip_prefix("FOR="))
                {
                    let unquoted = raw.trim_matches(|c| c == '"' || c == '\'');
                    let ip = strip_port(unquoted);
                    if !ip.is_empty() {
                        ips.push(ip);
                    }
                }
            }
        }
    } else {
        // Single-IP headers.
        let ip = strip_port(value);
        if !ip.is_empty() {
            ips.push(ip);
        }
    }

    ips
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn resolver() -> ProxyResolver {
        ProxyResolver::new(&ProxyConfig::default()).unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_untrusted_peer_is_the_client() {
        let r = resolver();
        let h = headers(&[("X-Forwarded-For", "198.51.100.9")]);
        let (ip, chain) = r.resolve("203.0.113.7:54321", &h);
        assert_eq!(ip, "203.0.113.7");
        assert!(chain.is_empty());
    }

    #[test]
    fn test_cloudflare_style_resolution() {
        let r = resolver();
        let h = headers(&[
            ("CF-Connecting-IP", "198.51.100.9"),
            ("X-Forwarded-For", "198.51.100.9, 10.0.0.1"),
        ]);
        let (ip, chain) = r.resolve("10.0.0.1:443", &h);
        assert_eq!(ip, "198.51.100.9");
        assert_eq!(chain, vec!["198.51.100.9", "10.0.0.1"]);
    }

    #[test]
    fn test_rightmost_untrusted_wins() {
        let r = resolver();
        // Client spoofed an extra hop on the left; the rightmost
        // non-trusted entry is the one the nearest proxy actually saw.
        let h = headers(&[(
            "X-Forwarded-For",
            "1.2.3.4, 198.51.100.9, 192.168.1.5",
        )]);
        let (ip, _) = r.resolve("127.0.0.1:1000", &h);
        assert_eq!(ip, "198.51.100.9");
    }

    #[test]
    fn test_forwarded_rfc7239_grammar() {
        let mut config = ProxyConfig::default();
        config.trusted_headers.push("Forwarded".to_string());
        let r = ProxyResolver::new(&config).unwrap();
        let h = headers(&[(
            "Forwarded",
            "for=\"198.51.100.9:4711\";proto=https, for=10.0.0.1",
        )]);
        let (ip, chain) = r.resolve("127.0.0.1:9", &h);
        assert_eq!(ip, "198.51.100.9");
        assert_eq!(chain, vec!["198.51.100.9", "10.0.0.1"]);
    }

    #[test]
    fn test_forwarded_ipv6_bracket_form_not_truncated() {
        let mut config = ProxyConfig::default();
        config.trusted_headers = vec!["Forwarded".to_string()];
        let r = ProxyResolver::new(&config).unwrap();
        let h = headers(&[("Forwarded", "for=\"[2001:db8::1]:8080\"")]);
        let (ip, _) = r.resolve("127.0.0.1:9", &h);
        assert_eq!(ip, "2001:db8::1");
    }

    #[test]
    fn test_all_private_chain_falls_back_to_peer() {
        let r = resolver();
        let h = headers(&[("X-Forwarded-For", "192.168.1.5, 10.0.0.2")]);
        let (ip, chain) = r.resolve("10.0.0.1:80", &h);
        // skip_private_ranges leaves no fallback candidate.
        assert_eq!(ip, "10.0.0.1");
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_chain_depth_truncation() {
        let mut config = ProxyConfig::default();
        config.max_proxy_depth = 3;
        let r = ProxyResolver::new(&config).unwrap();
        let h = headers(&[(
            "X-Forwarded-For",
            "1.1.1.1, 2.2.2.2, 3.3.3.3, 4.4.4.4, 5.5.5.5",
        )]);
        let (_, chain) = r.resolve("10.0.0.1:80", &h);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], "1.1.1.1");
    }

    #[test]
    fn test_header_priority_ordering() {
        let mut config = ProxyConfig::default();
        config.trusted_headers = vec![
            "X-Forwarded-For".to_string(),
            "X-Real-IP".to_string(),
        ];
        let r = ProxyResolver::new(&config).unwrap();
        // X-Real-IP (priority 80) is consulted before X-Forwarded-For
        // (70), so its IP leads the chain.
        let h = headers(&[
            ("X-Forwarded-For", "198.51.100.9"),
            ("X-Real-IP", "203.0.113.50"),
        ]);
        let (_, chain) = r.resolve("10.0.0.1:80", &h);
        assert_eq!(chain[0], "203.0.113.50");
    }

    #[test]
    fn test_bare_ip_accepted_as_trusted_proxy() {
        let mut config = ProxyConfig::default();
        config.trusted_proxies.push("203.0.113.100".to_string());
        let r = ProxyResolver::new(&config).unwrap();
        assert!(r.is_trusted_proxy("203.0.113.100"));
        assert!(!r.is_trusted_proxy("203.0.113.101"));
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let mut config = ProxyConfig::default();
        config.trusted_proxies.push("not-a-network".to_string());
        assert!(ProxyResolver::new(&config).is_err());
    }

    #[test]
    fn test_strip_port_forms() {
        assert_eq!(strip_port("1.2.3.4:80"), "1.2.3.4");
        assert_eq!(strip_port("1.2.3.4"), "1.2.3.4");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }
}

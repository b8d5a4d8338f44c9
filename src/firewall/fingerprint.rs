use std::collections::HashMap;
use std::net::IpAddr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::defaults;
use crate::models::access::AccessInfo;

/// Relative weight of each fingerprint component. A zero weight removes
/// the component from the derivation entirely.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FingerprintWeights {
    #[serde(default = "defaults::default_weight_ip")]
    pub ip: f64,
    #[serde(default = "defaults::default_weight_user_agent")]
    pub user_agent: f64,
    #[serde(default = "defaults::default_weight_headers")]
    pub headers: f64,
    #[serde(default = "defaults::default_weight_network")]
    pub network: f64,
    #[serde(default = "defaults::default_weight_device")]
    pub device: f64,
}

impl Default for FingerprintWeights {
    fn default() -> Self {
        Self {
            ip: defaults::default_weight_ip(),
            user_agent: defaults::default_weight_user_agent(),
            headers: defaults::default_weight_headers(),
            network: defaults::default_weight_network(),
            device: defaults::default_weight_device(),
        }
    }
}

/// Derives the stable, salted client fingerprint: a SHA-256 over
/// normalized request features. Normalization deliberately blurs the
/// parts that vary between benign requests (last IP octet, browser
/// patch versions, language q-weights) so one client keeps one
/// fingerprint across a session.
pub struct FingerprintGenerator {
    salt: String,
}

impl FingerprintGenerator {
    pub fn new(salt: &str) -> Self {
        let salt = if salt.is_empty() {
            defaults::default_fingerprint_salt()
        } else {
            salt.to_string()
        };
        Self { salt }
    }

    pub fn generate(&self, info: &AccessInfo) -> String {
        self.generate_with_weights(info, &FingerprintWeights::default())
    }

    pub fn generate_with_weights(
        &self,
        info: &AccessInfo,
        weights: &FingerprintWeights,
    ) -> String {
        let combined = self.combine(info, weights);
        let salted = format!("{}|salt:{}", combined, self.salt);

        let mut hasher = Sha256::new();
        hasher.update(salted.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// 16-hex short form for display, derived from the full fingerprint.
    pub fn generate_short(&self, info: &AccessInfo) -> String {
        let full = self.generate(info);
        let mut hasher = Md5::new();
        hasher.update(full.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn combine(&self, info: &AccessInfo, weights: &FingerprintWeights) -> String {
        let mut parts = Vec::with_capacity(5);

        if weights.ip > 0.0 {
            parts.push(format!("ip:{:.2}:{}", weights.ip, normalize_ip(&info.client_ip)));
        }
        if weights.user_agent > 0.0 {
            parts.push(format!(
                "ua:{:.2}:{}",
                weights.user_agent,
                normalize_user_agent(&info.user_agent)
            ));
        }
        if weights.headers > 0.0 {
            parts.push(format!(
                "hdr:{:.2}:{}",
                weights.headers,
                normalize_headers(&info.headers)
            ));
        }
        if weights.network > 0.0 {
            parts.push(format!("net:{:.2}:{}", weights.network, info.network));
        }
        if weights.device > 0.0 {
            parts.push(format!("dev:{:.2}:{}", weights.device, info.device));
        }

        parts.join("|")
    }
}

/// 64 hex characters and nothing else.
pub fn validate_fingerprint(fingerprint: &str) -> bool {
    fingerprint.len() == 64 && hex::decode(fingerprint).is_ok()
}

/// Bit-level similarity of two fingerprints in [0, 1]: one minus the
/// Hamming distance over the XORed digest bytes.
pub fn similarity(fp1: &str, fp2: &str) -> f64 {
    if !validate_fingerprint(fp1) || !validate_fingerprint(fp2) {
        return 0.0;
    }
    if fp1 == fp2 {
        return 1.0;
    }

    let bytes1 = hex::decode(fp1).unwrap_or_default();
    let bytes2 = hex::decode(fp2).unwrap_or_default();
    if bytes1.len() != bytes2.len() {
        return 0.0;
    }

    let differing_bits: u32 = bytes1
        .iter()
        .zip(bytes2.iter())
        .map(|(a, b)| (a ^ b).count_ones())
        .sum();
    let total_bits = (bytes1.len() * 8) as f64;

    1.0 - differing_bits as f64 / total_bits
}

/// IPv4: zero the last octet. IPv6: keep the upper 64 bits, rendered as
/// four 16-bit groups with a trailing `::`. Unparsable input passes
/// through untouched.
fn normalize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.{}.0", o[0], o[1], o[2])
        }
        Ok(IpAddr::V6(v6)) => {
            let o = v6.octets();
            format!(
                "{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}::",
                o[0], o[1], o[2], o[3], o[4], o[5], o[6], o[7]
            )
        }
        Err(_) => ip.to_string(),
    }
}

/// Map a User-Agent onto a closed `browser_os_engine` token triple.
/// Chrome wins over Safari when both substrings are present (every
/// Chrome UA carries "Safari").
fn normalize_user_agent(user_agent: &str) -> String {
    if user_agent.is_empty() {
        return "empty".to_string();
    }

    let ua = user_agent.to_lowercase();

    let browser = if ua.contains("chrome") {
        "chrome"
    } else if ua.contains("firefox") {
        "firefox"
    } else if ua.contains("safari") {
        "safari"
    } else if ua.contains("edge") {
        "edge"
    } else if ua.contains("opera") {
        "opera"
    } else {
        "other"
    };

    let os = if ua.contains("windows") {
        "windows"
    } else if ua.contains("mac os") || ua.contains("macos") {
        "macos"
    } else if ua.contains("linux") {
        "linux"
    } else if ua.contains("android") {
        "android"
    } else if ua.contains("ios") || ua.contains("iphone") || ua.contains("ipad") {
        "ios"
    } else {
        "other"
    };

    let engine = if ua.contains("webkit") {
        "webkit"
    } else if ua.contains("gecko") {
        "gecko"
    } else if ua.contains("trident") {
        "trident"
    } else {
        "other"
    };

    format!("{}_{}_{}", browser, os, engine)
}

/// Stable headers only, as sorted `Name:Value` pairs joined by `|`.
fn normalize_headers(headers: &HashMap<String, String>) -> String {
    const STABLE_HEADERS: &[&str] = &[
        "Accept",
        "Accept-Language",
        "Accept-Encoding",
        "DNT",
        "Upgrade-Insecure-Requests",
    ];

    let mut parts = Vec::new();
    for name in STABLE_HEADERS {
        if let Some(value) = headers.get(*name) {
            let value = if *name == "Accept-Language" {
                normalize_accept_language(value)
            } else {
                value.clone()
            };
            parts.push(format!("{}:{}", name, value));
        }
    }

    if parts.is_empty() {
        return "empty".to_string();
    }

    parts.sort();
    parts.join("|")
}

/// Primary language codes only: drop q-weights and region suffixes,
/// de-duplicate, sort.
fn normalize_accept_language(accept_language: &str) -> String {
    if accept_language.is_empty() {
        return "empty".to_string();
    }

    let mut langs: Vec<String> = accept_language
        .split(',')
        .filter_map(|part| {
            let lang = part.trim();
            let lang = lang.split(';').next().unwrap_or("");
            let lang = lang.split('-').next().unwrap_or("");
            if lang.is_empty() {
                None
            } else {
                Some(lang.to_string())
            }
        })
        .collect();

    langs.sort();
    langs.dedup();

    if langs.is_empty() {
        return "empty".to_string();
    }
    langs.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::access::{DeviceClass, NetworkClass};
    use chrono::Utc;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn info(ip: &str, ua: &str) -> AccessInfo {
        AccessInfo {
            client_ip: ip.to_string(),
            remote_addr: ip.to_string(),
            proxy_chain: Vec::new(),
            user_agent: ua.to_string(),
            referer: String::new(),
            path: "/".to_string(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            proxy_headers: HashMap::new(),
            device: DeviceClass::Desktop,
            network: NetworkClass::Broadband,
            is_bot: false,
            is_logged_in: false,
            is_behind_proxy: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_deterministic_for_equal_normalized_components() {
        let generator = FingerprintGenerator::new("test-salt");
        // Same /24, same UA family: same fingerprint.
        let a = generator.generate(&info("203.0.113.7", CHROME_UA));
        let b = generator.generate(&info("203.0.113.99", CHROME_UA));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_clients_distinct_fingerprints() {
        let generator = FingerprintGenerator::new("test-salt");
        let a = generator.generate(&info("203.0.113.7", CHROME_UA));
        let b = generator.generate(&info("198.51.100.7", CHROME_UA));
        assert_ne!(a, b);
    }

    #[test]
    fn test_salt_changes_fingerprint() {
        let a = FingerprintGenerator::new("salt-a").generate(&info("203.0.113.7", CHROME_UA));
        let b = FingerprintGenerator::new("salt-b").generate(&info("203.0.113.7", CHROME_UA));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_format() {
        let generator = FingerprintGenerator::new("test-salt");
        let fp = generator.generate(&info("203.0.113.7", CHROME_UA));
        assert!(validate_fingerprint(&fp));

        let short = generator.generate_short(&info("203.0.113.7", CHROME_UA));
        assert_eq!(short.len(), 16);
        assert!(hex::decode(&short).is_ok());
    }

    #[test]
    fn test_normalize_ip() {
        assert_eq!(normalize_ip("203.0.113.77"), "203.0.113.0");
        assert_eq!(
            normalize_ip("2001:db8:85a3:1234:5678:8a2e:370:7334"),
            "2001:0db8:85a3:1234::"
        );
        assert_eq!(normalize_ip("garbage"), "garbage");
    }

    #[test]
    fn test_normalize_user_agent() {
        assert_eq!(normalize_user_agent(CHROME_UA), "chrome_windows_webkit");
        assert_eq!(
            normalize_user_agent(
                "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0"
            ),
            "firefox_linux_gecko"
        );
        assert_eq!(
            normalize_user_agent(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                 (KHTML, like Gecko) Version/17.0 Safari/605.1.15"
            ),
            "safari_macos_webkit"
        );
        assert_eq!(normalize_user_agent(""), "empty");
        assert_eq!(normalize_user_agent("weird"), "other_other_other");
    }

    #[test]
    fn test_accept_language_normalization_idempotent() {
        let once = normalize_accept_language("en-US,en;q=0.9,de-DE;q=0.8");
        assert_eq!(once, "de,en");
        assert_eq!(normalize_accept_language(&once), once);
    }

    #[test]
    fn test_headers_sorted_and_stable() {
        let mut headers = HashMap::new();
        headers.insert("DNT".to_string(), "1".to_string());
        headers.insert("Accept".to_string(), "text/html".to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());

        let normalized = normalize_headers(&headers);
        // Connection is not in the stable set.
        assert_eq!(normalized, "Accept:text/html|DNT:1");
    }

    #[test]
    fn test_similarity() {
        let generator = FingerprintGenerator::new("test-salt");
        let a = generator.generate(&info("203.0.113.7", CHROME_UA));
        let b = generator.generate(&info("198.51.100.7", CHROME_UA));

        assert_eq!(similarity(&a, &a), 1.0);
        let cross = similarity(&a, &b);
        assert!(cross < 1.0 && cross > 0.0);
        assert_eq!(similarity(&a, "invalid"), 0.0);
    }
}

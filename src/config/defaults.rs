use std::collections::HashMap;

// server

pub fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

// redis

pub fn default_redis_enabled() -> bool {
    true
}

pub fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

pub fn default_op_timeout_ms() -> u64 {
    500
}

// storage

pub fn default_sqlite_path() -> String {
    "palisade.db".to_string()
}

pub fn default_retention_days() -> u32 {
    30
}

// admin api

pub fn default_api_key() -> String {
    "change-me".to_string()
}

// logging

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_file() -> String {
    "logs/palisade.log".to_string()
}

// proxy resolution

pub fn default_trusted_proxies() -> Vec<String> {
    vec![
        "127.0.0.1/32".to_string(),
        "10.0.0.0/8".to_string(),
        "172.16.0.0/12".to_string(),
        "192.168.0.0/16".to_string(),
        "::1/128".to_string(),
        "fc00::/7".to_string(),
    ]
}

pub fn default_trusted_headers() -> Vec<String> {
    vec![
        "X-Real-IP".to_string(),
        "X-Forwarded-For".to_string(),
        "CF-Connecting-IP".to_string(),
        "True-Client-IP".to_string(),
    ]
}

pub fn default_header_priority() -> HashMap<String, i32> {
    HashMap::from([
        ("CF-Connecting-IP".to_string(), 100),
        ("True-Client-IP".to_string(), 90),
        ("X-Real-IP".to_string(), 80),
        ("X-Forwarded-For".to_string(), 70),
        ("X-Client-IP".to_string(), 60),
    ])
}

pub fn default_skip_private_ranges() -> bool {
    true
}

pub fn default_max_proxy_depth() -> usize {
    10
}

// fingerprint

pub fn default_fingerprint_salt() -> String {
    "palisade-default-salt".to_string()
}

pub fn default_weight_ip() -> f64 {
    0.40
}

pub fn default_weight_user_agent() -> f64 {
    0.30
}

pub fn default_weight_headers() -> f64 {
    0.15
}

pub fn default_weight_network() -> f64 {
    0.10
}

pub fn default_weight_device() -> f64 {
    0.05
}

// scoring

pub fn default_initial_score() -> i32 {
    100
}

pub fn default_normal_access_bonus() -> i32 {
    1
}

pub fn default_max_score() -> i32 {
    100
}

pub fn default_frequent_request_penalty() -> i32 {
    -10
}

pub fn default_suspicious_ua_penalty() -> i32 {
    -20
}

pub fn default_ban_threshold() -> i32 {
    0
}

pub fn default_bot_penalty() -> i32 {
    -15
}

pub fn default_proxy_penalty() -> i32 {
    -5
}

pub fn default_path_spam_penalty() -> i32 {
    -8
}

pub fn default_no_referer_penalty() -> i32 {
    -2
}

// analyzer

pub fn default_suspicious_request_threshold() -> usize {
    50
}

pub fn default_path_repeat_threshold() -> usize {
    10
}

pub fn default_bot_detection_enabled() -> bool {
    true
}

pub fn default_analysis_window_secs() -> u64 {
    3600
}

// limiter

pub fn default_rate_limit_window_secs() -> u64 {
    60
}

pub fn default_max_requests_per_window() -> u64 {
    100
}

pub fn default_ban_duration_secs() -> u64 {
    3600
}

pub fn default_delay_response_ms() -> u64 {
    1000
}

pub fn default_warning_threshold() -> i32 {
    30
}

pub fn default_critical_threshold() -> i32 {
    10
}

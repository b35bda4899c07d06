use std::path::PathBuf;

use tokio::time::Duration;

use crate::{extractor::DEFAULT_RESOLVER_TIMEOUT, rate_limit, relay::DEFAULT_IDLE_TIMEOUT};

const DEFAULT_PORT: u16 = 3000;

/// Runtime settings, read once from the environment at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub yt_dlp_path: PathBuf,
    pub extractor_timeout: Duration,
    pub relay_idle_timeout: Duration,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: resolve_bind_addr(),
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins: read_list_env("ALLOWED_ORIGINS"),
            yt_dlp_path: std::env::var("YT_DLP_PATH")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("yt-dlp")),
            extractor_timeout: read_seconds_env("EXTRACTOR_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_RESOLVER_TIMEOUT),
            relay_idle_timeout: read_seconds_env("RELAY_IDLE_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            rate_limit_max_requests: read_u64_env("RATE_LIMIT_MAX_REQUESTS")
                .and_then(|value| u32::try_from(value).ok())
                .filter(|value| *value > 0)
                .unwrap_or(rate_limit::DEFAULT_MAX_REQUESTS),
            rate_limit_window: read_seconds_env("RATE_LIMIT_WINDOW_SECONDS")
                .unwrap_or(rate_limit::DEFAULT_WINDOW),
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("0.0.0.0:{port}")
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    parse_bool(&value)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Zero is treated as unset.
fn read_seconds_env(name: &str) -> Option<Duration> {
    read_u64_env(name)
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs)
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

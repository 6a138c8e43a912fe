//! Crawler configuration.
//!
//! All knobs are read once from the environment (with `.env` support) into
//! an owned struct that is passed down by reference. Components never read
//! `std::env` themselves.

use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_or_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Base URL of the target site.
    pub base_url: String,
    /// Proxy candidate file, one `host:port[:user:pass]` per line.
    /// Consumed destructively: failed/blocked entries are removed.
    pub proxy_file: PathBuf,
    /// Raw extraction sink (JSON array keyed by site id).
    pub raw_store: PathBuf,
    /// Validated record sink (JSON array keyed by site id).
    pub validated_store: PathBuf,

    /// Run Chrome with `--headless=new` instead of a visible window.
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,

    /// Hard cap on result pages walked per brand.
    pub max_pages: u32,
    /// Consecutive empty result pages before a brand is abandoned.
    pub empty_page_threshold: u32,
    /// Detail-page load attempts before the listing is skipped.
    pub detail_retries: u32,

    /// Listings processed before a cooldown pause kicks in.
    pub cooldown_after: u32,
    /// Length of the cooldown pause.
    pub cooldown_secs: u64,
    /// Listings processed before proxy IP rotation is requested.
    pub rotate_after: u32,

    /// Poll interval of the access-denied monitor.
    pub monitor_interval_secs: u64,
    /// Timeout for the outbound proxy probe.
    pub probe_timeout_secs: u64,
}

impl CrawlerConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or_str("CRAWLER_BASE_URL", "https://www.mobile.de"),
            proxy_file: PathBuf::from(env_or_str("CRAWLER_PROXY_FILE", "proxy.txt")),
            raw_store: PathBuf::from(env_or_str("CRAWLER_RAW_STORE", "raw_listings.json")),
            validated_store: PathBuf::from(env_or_str(
                "CRAWLER_VALIDATED_STORE",
                "validated_listings.json",
            )),
            headless: env_or("CRAWLER_HEADLESS", false),
            window_width: env_or("CRAWLER_WINDOW_WIDTH", 1200),
            window_height: env_or("CRAWLER_WINDOW_HEIGHT", 1000),
            max_pages: env_or("CRAWLER_MAX_PAGES", 10),
            empty_page_threshold: env_or("CRAWLER_EMPTY_PAGE_THRESHOLD", 3),
            detail_retries: env_or("CRAWLER_DETAIL_RETRIES", 3),
            cooldown_after: env_or("CRAWLER_COOLDOWN_AFTER", 10),
            cooldown_secs: env_or("CRAWLER_COOLDOWN_SECS", 120),
            rotate_after: env_or("CRAWLER_ROTATE_AFTER", 50),
            monitor_interval_secs: env_or("CRAWLER_MONITOR_INTERVAL_SECS", 5),
            probe_timeout_secs: env_or("CRAWLER_PROBE_TIMEOUT_SECS", 10),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let cfg = CrawlerConfig::from_env();
        assert_eq!(cfg.max_pages, 10);
        assert_eq!(cfg.empty_page_threshold, 3);
        assert_eq!(cfg.detail_retries, 3);
        assert_eq!(cfg.monitor_interval_secs, 5);
        assert!(cfg.base_url.starts_with("https://"));
    }
}

//! Access-denied detection.
//!
//! The site's bot protection can swap a block page in asynchronously, in
//! the middle of an extraction. A background task polls the page every few
//! seconds and publishes a single immutable [`AccessDeniedEvent`] the
//! moment a block signature shows up; the main worker polls the flag at
//! its checkpoints and raises the typed error itself. The monitor never
//! raises directly.
//!
//! Connection-timeout pages look superficially similar but mean the exact
//! opposite (the proxy is slow, not burned), so the two signature sets are
//! kept disjoint and classified separately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use headless_chrome::Tab;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use tracing::{debug, error, info};

use crate::error::CrawlError;

/// Chrome network-error / slow-upstream phrasing. Not a block.
const TIMEOUT_SIGNATURES: &[&str] = &[
    "can't be reached",
    "took too long to respond",
    "timed out",
    "err_connection",
    "err_timed_out",
    "err_proxy_connection_failed",
    "err_tunnel_connection_failed",
    "no internet",
];

/// Bot-protection phrasing. Any of these means the proxy is burned.
const BLOCK_SIGNATURES: &[&str] = &[
    "access denied",
    "pardon our interruption",
    "verify you are a human",
    "are you a robot",
    "bot detection",
    "automated access",
];

/// Weaker "blocked" wording only counts alongside corroborating context,
/// otherwise ordinary listing text ("blocked drain cleaner") would trip it.
const BLOCK_CONTEXT: &[&str] = &["security", "denied", "permission", "request", "bot"];

static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[Rr]eference\s*#\s*([A-Za-z0-9][A-Za-z0-9.\-]*)").unwrap());

/// Classification of a rendered page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageClass {
    Normal,
    /// Connection error / slow load. Bounded retry, not abort.
    Timeout,
    /// Block page, optionally carrying the site's reference code.
    Blocked { reference: Option<String> },
}

/// Classify title + content against the two signature sets.
pub fn classify_page(title: &str, content: &str) -> PageClass {
    let haystack = format!("{}\n{}", title, content).to_lowercase();

    if BLOCK_SIGNATURES.iter().any(|sig| haystack.contains(sig))
        || REFERENCE_RE.is_match(content)
        || (haystack.contains("blocked") && BLOCK_CONTEXT.iter().any(|c| haystack.contains(c)))
    {
        let reference = REFERENCE_RE
            .captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        return PageClass::Blocked { reference };
    }

    if TIMEOUT_SIGNATURES.iter().any(|sig| haystack.contains(sig)) {
        return PageClass::Timeout;
    }

    PageClass::Normal
}

/// What the monitor saw when it caught the block.
#[derive(Debug, Clone)]
pub struct AccessDeniedEvent {
    pub reference: Option<String>,
    pub url: String,
    pub detected_at: DateTime<Utc>,
}

struct MonitorShared {
    detected: AtomicBool,
    stop: AtomicBool,
    event: OnceCell<AccessDeniedEvent>,
}

/// Handle to the background watcher attached to one browser session.
/// Owned by that session's crawl attempt; dropped (and joined) with it.
pub struct AccessDeniedMonitor {
    shared: Arc<MonitorShared>,
    handle: Option<JoinHandle<()>>,
}

impl AccessDeniedMonitor {
    /// Attach a watcher to the given tab, polling at `interval`.
    pub fn spawn(tab: Arc<Tab>, interval: Duration) -> Self {
        let shared = Arc::new(MonitorShared {
            detected: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            event: OnceCell::new(),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::spawn(move || {
            debug!("👁️ Access-denied monitor attached (every {:?})", interval);
            loop {
                // Sleep in short slices so stop() doesn't wait a full interval.
                let mut slept = Duration::ZERO;
                while slept < interval {
                    if thread_shared.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(250));
                    slept += Duration::from_millis(250);
                }

                let title = tab.get_title().unwrap_or_default();
                let content = match tab.get_content() {
                    Ok(content) => content,
                    // A mid-navigation tab has no content; just poll again.
                    Err(_) => continue,
                };

                if let PageClass::Blocked { reference } = classify_page(&title, &content) {
                    let event = AccessDeniedEvent {
                        reference: reference.clone(),
                        url: tab.get_url(),
                        detected_at: Utc::now(),
                    };
                    error!(
                        "🚫 Access denied detected at {} (reference: {}, {})",
                        event.url,
                        reference.as_deref().unwrap_or("none"),
                        event.detected_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    let _ = thread_shared.event.set(event);
                    thread_shared.detected.store(true, Ordering::SeqCst);
                    return; // one detection per session, polling stops
                }
            }
        });

        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn is_access_denied(&self) -> bool {
        self.shared.detected.load(Ordering::SeqCst)
    }

    pub fn event(&self) -> Option<AccessDeniedEvent> {
        self.shared.event.get().cloned()
    }

    /// Checkpoint poll: raises the typed error when the flag is set.
    pub fn check(&self) -> Result<(), CrawlError> {
        if self.is_access_denied() {
            let reference = self.event().and_then(|e| e.reference);
            return Err(CrawlError::AccessDenied { reference });
        }
        Ok(())
    }

    /// Detach the watcher. Also runs on drop.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!("👁️ Access-denied monitor detached");
        }
    }
}

impl Drop for AccessDeniedMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_page_with_reference() {
        let content = "<html><body><h1>Access Denied</h1>\
                       <p>You don't have permission. Reference #12345</p></body></html>";
        match classify_page("Access Denied", content) {
            PageClass::Blocked { reference } => assert_eq!(reference.as_deref(), Some("12345")),
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_reference_code_alone_is_a_block() {
        let content = "An error occurred. Reference #18.d7c1160.1699999999.2ab44ef";
        match classify_page("", content) {
            PageClass::Blocked { reference } => {
                assert_eq!(reference.as_deref(), Some("18.d7c1160.1699999999.2ab44ef"));
            }
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_page_is_not_a_block() {
        let content = "This site can't be reached. www.example.com took too long to respond.";
        assert_eq!(classify_page("", content), PageClass::Timeout);
    }

    #[test]
    fn test_proxy_error_is_timeout() {
        assert_eq!(
            classify_page("", "ERR_PROXY_CONNECTION_FAILED"),
            PageClass::Timeout
        );
    }

    #[test]
    fn test_blocked_needs_corroboration() {
        // "blocked" in ordinary listing prose must not trip the detector.
        assert_eq!(
            classify_page("BMW 320d", "Pollen filter never blocked, garage kept"),
            PageClass::Normal
        );
        match classify_page("", "Your request has been blocked by our security team") {
            PageClass::Blocked { reference } => assert!(reference.is_none()),
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_bot_check_phrasing_is_a_block() {
        assert!(matches!(
            classify_page("One more step", "Please verify you are a human to continue"),
            PageClass::Blocked { .. }
        ));
    }

    #[test]
    fn test_normal_listing_page() {
        let content = "<html><body>BMW 320d Touring, 35.980 €, Kilometerstand 78.378 km</body></html>";
        assert_eq!(classify_page("BMW Gebrauchtwagen", content), PageClass::Normal);
    }
}

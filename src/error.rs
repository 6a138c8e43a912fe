//! Crawl error taxonomy.
//!
//! Expected conditions (dead proxy, blocked session, timeout page) are
//! modelled as explicit variants instead of stringly-typed failures, so the
//! caller can decide between retire-and-rotate and skip-and-continue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    /// The proxy could not be probed or the browser could not connect
    /// through it. Non-fatal to the run: retire the candidate, try the next.
    #[error("proxy failure: {0}")]
    ProxyFailure(String),

    /// The target site served a block page. Fatal to the whole session:
    /// the proxy is burned and must be retired before rotating.
    #[error("access denied by target site (reference: {})", .reference.as_deref().unwrap_or("none"))]
    AccessDenied { reference: Option<String> },

    /// A detail page kept timing out after the bounded retry budget.
    /// Skips only the one listing.
    #[error("page timed out after {attempts} attempts")]
    TimeoutPage { attempts: u32 },

    /// Unrecoverable browser/session error (crashed tab, dead websocket).
    #[error("browser session error: {0}")]
    Session(#[from] anyhow::Error),
}

impl CrawlError {
    /// Whether the error ends the whole crawl attempt under the current
    /// proxy (as opposed to skipping a single listing).
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            CrawlError::AccessDenied { .. } | CrawlError::Session(_) | CrawlError::ProxyFailure(_)
        )
    }

    /// Whether the proxy that carried this session should be removed from
    /// the candidate file.
    pub fn should_retire_proxy(&self) -> bool {
        matches!(
            self,
            CrawlError::AccessDenied { .. } | CrawlError::ProxyFailure(_)
        )
    }
}

//! Result-page pagination per brand.
//!
//! A page walk is a small state machine: locate listing containers through
//! an ordered fallback selector set, drop promotional blocks that share the
//! listing markup but have no contact control, track consecutive empty
//! pages, and advance by clicking "next" with verification through the URL
//! actually changing (the control itself is sometimes rendered but dead).

use anyhow::Result;
use headless_chrome::Element;
use tracing::{debug, info};

use crate::session::BrowserSession;

/// Listing-container lookup, most specific first. The `data-testid` form is
/// the current markup; the rest are drift safety nets.
pub const LISTING_CONTAINER_SELECTORS: &[&str] = &[
    "[data-testid^='result-listing-']",
    "article[data-testid*='listing']",
    "div[class*='result-item']",
];

/// "Next page" controls, again ordered by how annotated the markup is.
pub const NEXT_CONTROL_SELECTORS: &[&str] = &[
    "button[data-testid='pagination:next']",
    "a[data-testid='pagination:next']",
    "button[aria-label='Weiter']",
    "a[aria-label='Weiter']",
];

/// Real listings carry a contact action; ads and teaser blocks don't.
const CONTACT_PROBE_JS: &str = r#"function() {
    return !!this.querySelector(
        "[data-testid*='contact'], [data-testid*='Contact'], " +
        "button[class*='contact'], a[href*='kontakt']"
    );
}"#;

const TESTID_JS: &str = "function() { return this.getAttribute('data-testid'); }";

const ENABLED_JS: &str = r#"function() {
    return !this.disabled && this.getAttribute('aria-disabled') !== 'true';
}"#;

/// A filtered listing container, addressed by its position in the merged
/// container list so it can be re-located after other DOM work.
#[derive(Debug, Clone)]
pub struct CandidateRef {
    pub index: usize,
    /// Site id parsed from the container's own testid, when present.
    /// Lets the dedup check run before the detail page is ever opened.
    pub site_id: Option<String>,
}

/// Parse the site id out of a `result-listing-<id>` testid.
pub fn site_id_from_testid(testid: &str) -> Option<String> {
    testid
        .strip_prefix("result-listing-")
        .filter(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

fn element_bool(element: &Element, js: &str) -> bool {
    element
        .call_js_fn(js, vec![], false)
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn element_testid(element: &Element) -> Option<String> {
    element
        .call_js_fn(TESTID_JS, vec![], false)
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_str().map(str::to_string))
}

/// Locate the real listings on the current results page.
pub fn collect_candidates(session: &BrowserSession) -> Vec<CandidateRef> {
    let containers = session.find_all(LISTING_CONTAINER_SELECTORS);
    let total = containers.len();

    let candidates: Vec<CandidateRef> = containers
        .iter()
        .enumerate()
        .filter(|(_, el)| element_bool(el, CONTACT_PROBE_JS))
        .map(|(index, el)| CandidateRef {
            index,
            site_id: element_testid(el).and_then(|t| site_id_from_testid(&t)),
        })
        .collect();

    debug!(
        "📋 {} containers on page, {} pass the contact-control filter",
        total,
        candidates.len()
    );
    candidates
}

/// Re-locate a candidate's container after unrelated DOM work.
pub fn locate_candidate<'a>(
    session: &'a BrowserSession,
    candidate: &CandidateRef,
) -> Option<Element<'a>> {
    let mut containers = session.find_all(LISTING_CONTAINER_SELECTORS);
    if candidate.index < containers.len() {
        Some(containers.swap_remove(candidate.index))
    } else {
        None
    }
}

/// Whether an enabled "next" control is present on the current page.
pub fn has_enabled_next(session: &BrowserSession) -> bool {
    session
        .find_all(NEXT_CONTROL_SELECTORS)
        .iter()
        .any(|el| element_bool(el, ENABLED_JS))
}

/// Click the first enabled "next" control. Returns false when none exists;
/// whether the click actually advanced is verified by the caller via the
/// URL (see [`PageCursor::note_advance`]).
pub fn click_next(session: &BrowserSession) -> Result<bool> {
    let controls = session.find_all(NEXT_CONTROL_SELECTORS);
    let next = controls.into_iter().find(|el| element_bool(el, ENABLED_JS));
    match next {
        Some(el) => {
            session.scroll_click(&el)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Why a brand's pagination ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndReason {
    /// Zero real listings on page 1: the brand has no inventory.
    NoInventory,
    /// Too many consecutive empty pages.
    EmptyPages,
    /// No enabled "next" control left.
    NoNextControl,
    /// "next" was clicked but the URL did not change.
    UrlUnchanged,
    /// Page cap reached.
    MaxPages,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BrandStep {
    Continue,
    End(EndReason),
}

/// Per-brand pagination bookkeeping: page counter, cap, and the
/// consecutive-empty-page ledger.
#[derive(Debug)]
pub struct PageCursor {
    page: u32,
    max_pages: u32,
    consecutive_empty: u32,
    empty_threshold: u32,
}

impl PageCursor {
    pub fn new(max_pages: u32, empty_threshold: u32) -> Self {
        Self {
            page: 1,
            max_pages,
            consecutive_empty: 0,
            empty_threshold,
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    /// Record what the current page yielded, before any listing is opened.
    pub fn note_results(&mut self, real_listings: usize, next_enabled: bool) -> BrandStep {
        if real_listings > 0 {
            self.consecutive_empty = 0;
            return BrandStep::Continue;
        }

        if self.page == 1 {
            return BrandStep::End(EndReason::NoInventory);
        }

        self.consecutive_empty += 1;
        if self.consecutive_empty >= self.empty_threshold {
            return BrandStep::End(EndReason::EmptyPages);
        }
        // A structurally anomalous page in the middle of a brand: advance
        // past it as long as the site still offers a next page.
        if !next_enabled {
            return BrandStep::End(EndReason::NoNextControl);
        }
        BrandStep::Continue
    }

    /// Record the outcome of a "next" click. Advancement counts only when
    /// the URL actually changed.
    pub fn note_advance(&mut self, url_before: &str, url_after: &str, clicked: bool) -> BrandStep {
        if !clicked {
            return BrandStep::End(EndReason::NoNextControl);
        }
        if url_after.is_empty() || url_after == url_before {
            return BrandStep::End(EndReason::UrlUnchanged);
        }
        self.page += 1;
        if self.page > self.max_pages {
            return BrandStep::End(EndReason::MaxPages);
        }
        info!("📄 Advanced to results page {}", self.page);
        BrandStep::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_id_from_testid() {
        assert_eq!(
            site_id_from_testid("result-listing-398765123"),
            Some("398765123".to_string())
        );
        assert_eq!(site_id_from_testid("result-listing-"), None);
        assert_eq!(site_id_from_testid("result-listing-ad-slot"), None);
        assert_eq!(site_id_from_testid("something-else"), None);
    }

    #[test]
    fn test_empty_first_page_aborts_brand() {
        let mut cursor = PageCursor::new(10, 3);
        assert_eq!(
            cursor.note_results(0, true),
            BrandStep::End(EndReason::NoInventory)
        );
    }

    #[test]
    fn test_three_consecutive_empty_pages_abort() {
        let mut cursor = PageCursor::new(10, 3);
        assert_eq!(cursor.note_results(5, true), BrandStep::Continue);
        assert_eq!(cursor.note_advance("p1", "p2", true), BrandStep::Continue);

        // Three empty pages in a row end the brand even though "next"
        // stays clickable the whole time.
        assert_eq!(cursor.note_results(0, true), BrandStep::Continue);
        assert_eq!(cursor.note_advance("p2", "p3", true), BrandStep::Continue);
        assert_eq!(cursor.note_results(0, true), BrandStep::Continue);
        assert_eq!(cursor.note_advance("p3", "p4", true), BrandStep::Continue);
        assert_eq!(
            cursor.note_results(0, true),
            BrandStep::End(EndReason::EmptyPages)
        );
    }

    #[test]
    fn test_found_page_resets_empty_counter() {
        let mut cursor = PageCursor::new(10, 3);
        cursor.note_results(3, true);
        cursor.note_advance("p1", "p2", true);
        cursor.note_results(0, true);
        cursor.note_advance("p2", "p3", true);
        cursor.note_results(0, true);
        cursor.note_advance("p3", "p4", true);
        // Results again: ledger resets, two more empties don't abort.
        assert_eq!(cursor.note_results(4, true), BrandStep::Continue);
        cursor.note_advance("p4", "p5", true);
        assert_eq!(cursor.note_results(0, true), BrandStep::Continue);
        cursor.note_advance("p5", "p6", true);
        assert_eq!(cursor.note_results(0, true), BrandStep::Continue);
    }

    #[test]
    fn test_unchanged_url_ends_brand() {
        // A "next" control that is always clickable but always lands on the
        // same URL must terminate the walk immediately.
        let mut cursor = PageCursor::new(10, 3);
        assert_eq!(cursor.note_results(5, true), BrandStep::Continue);
        assert_eq!(
            cursor.note_advance("page-1-url", "page-1-url", true),
            BrandStep::End(EndReason::UrlUnchanged)
        );
        assert_eq!(cursor.page(), 1);
    }

    #[test]
    fn test_terminates_within_max_pages() {
        // Even with endless results and a URL that changes every time, the
        // walk stops at the cap.
        let max_pages = 10;
        let mut cursor = PageCursor::new(max_pages, 3);
        let mut pages_processed = 0;

        for i in 0.. {
            assert!(i < 100, "paginator failed to terminate");
            match cursor.note_results(20, true) {
                BrandStep::Continue => pages_processed += 1,
                BrandStep::End(_) => break,
            }
            let before = format!("url-{}", i);
            let after = format!("url-{}", i + 1);
            if let BrandStep::End(reason) = cursor.note_advance(&before, &after, true) {
                assert_eq!(reason, EndReason::MaxPages);
                break;
            }
        }
        assert_eq!(pages_processed, max_pages);
    }

    #[test]
    fn test_missing_next_control_ends_brand() {
        let mut cursor = PageCursor::new(10, 3);
        cursor.note_results(5, true);
        assert_eq!(
            cursor.note_advance("p1", "p1", false),
            BrandStep::End(EndReason::NoNextControl)
        );
    }
}

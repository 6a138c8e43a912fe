//! Detail-page extraction.
//!
//! Opens one listing candidate, branches on whether the click spawned a
//! new tab (desktop layout) or navigated in place (compact layout), loads
//! the detail view with a bounded retry loop, and reads a fixed
//! multi-section schema. Every section is wrapped so a missing or
//! unparseable field degrades to a sentinel instead of sinking the record.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::CrawlerConfig;
use crate::error::CrawlError;
use crate::monitor::PageClass;
use crate::paginator::{locate_candidate, CandidateRef};
use crate::session::BrowserSession;
use crate::stealth;

/// Sentinel stored when a field is absent from the page.
pub const NOT_FOUND: &str = "Not found";

// ============================================================================
// Raw record schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicInfo {
    pub brand: String,
    pub model: String,
    pub title: String,
    pub price_text: String,
    pub url: String,
    pub site_id: String,
    pub location_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFeatures {
    pub mileage_text: String,
    pub power_text: String,
    pub fuel_type: String,
    pub transmission_text: String,
    pub first_registration_text: String,
    pub previous_owners_text: String,
    pub battery_range_text: String,
    pub warranty_text: String,
}

/// One extracted listing, exactly as the page showed it. Values are kept
/// as raw label/value text; typing happens in the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListing {
    pub basic_info: BasicInfo,
    pub key_features: KeyFeatures,
    /// The site's own technical-data vocabulary is open-ended, so this
    /// stays an open key -> text map.
    pub technical_data: BTreeMap<String, String>,
    /// German equipment label -> present.
    pub equipment: BTreeMap<String, bool>,
    pub scraped_at: DateTime<Utc>,
}

impl RawListing {
    pub fn site_id(&self) -> &str {
        &self.basic_info.site_id
    }
}

// ============================================================================
// Pure section parsers (over the rendered detail-page HTML)
// ============================================================================

static ID_PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?&]id=(\d+)").unwrap());
static LONG_DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{6,}").unwrap());
static POSTAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"DE-\d{5}").unwrap());

/// The site's numeric listing id, from the `id` query param or, failing
/// that, the last long digit run in the detail URL.
pub fn extract_site_id(url: &str) -> Option<String> {
    if let Some(caps) = ID_PARAM_RE.captures(url) {
        return Some(caps[1].to_string());
    }
    LONG_DIGITS_RE
        .find_iter(url)
        .last()
        .map(|m| m.as_str().to_string())
}

/// Text nodes of an element, trimmed and newline-joined. Keeps the
/// "label\nvalue" shape the site renders feature boxes in.
fn node_text(element: ElementRef) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn select_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(node_text)
        .filter(|t| !t.is_empty())
}

fn model_from_title(title: &str, brand: &str) -> String {
    let title = title.trim();
    if title.is_char_boundary(brand.len())
        && title.len() > brand.len()
        && title[..brand.len()].eq_ignore_ascii_case(brand)
    {
        let rest = title[brand.len()..].trim();
        if !rest.is_empty() {
            return rest.to_string();
        }
    }
    title.to_string()
}

pub fn parse_basic_info(document: &Html, brand: &str, url: &str) -> BasicInfo {
    let title_sel = Selector::parse("h2").unwrap();
    let price_sel = Selector::parse("div[data-testid='vip-price-label']").unwrap();

    let title = select_text(document, &title_sel).unwrap_or_else(|| NOT_FOUND.to_string());
    let price_text = select_text(document, &price_sel).unwrap_or_else(|| NOT_FOUND.to_string());
    let site_id = extract_site_id(url).unwrap_or_else(|| url.to_string());
    let model = if title == NOT_FOUND {
        NOT_FOUND.to_string()
    } else {
        model_from_title(&title, brand)
    };

    BasicInfo {
        brand: brand.to_string(),
        model,
        title,
        price_text,
        url: url.to_string(),
        site_id,
        location_text: parse_location(document),
    }
}

fn key_feature(document: &Html, item: &str) -> String {
    let selector =
        Selector::parse(&format!("div[data-testid='vip-key-features-list-item-{}']", item))
            .unwrap();
    select_text(document, &selector).unwrap_or_else(|| NOT_FOUND.to_string())
}

pub fn parse_key_features(document: &Html) -> KeyFeatures {
    KeyFeatures {
        mileage_text: key_feature(document, "mileage"),
        power_text: key_feature(document, "power"),
        fuel_type: key_feature(document, "fuel"),
        transmission_text: key_feature(document, "transmission"),
        first_registration_text: key_feature(document, "firstRegistration"),
        previous_owners_text: key_feature(document, "numberOfPreviousOwners"),
        battery_range_text: key_feature(document, "batteryRange"),
        warranty_text: key_feature(document, "warrantyRegistration"),
    }
}

/// Read every `dt[data-testid]`/`dd` pair out of the (expanded) technical
/// data lists. Pairing is positional within each `dl`, matching how the
/// site lays the definition lists out.
pub fn parse_technical_data(document: &Html) -> BTreeMap<String, String> {
    let dl_sel = Selector::parse("dl").unwrap();
    let dt_sel = Selector::parse("dt").unwrap();
    let dd_sel = Selector::parse("dd").unwrap();

    let mut data = BTreeMap::new();
    for dl in document.select(&dl_sel) {
        let dts: Vec<ElementRef> = dl.select(&dt_sel).collect();
        let dds: Vec<ElementRef> = dl.select(&dd_sel).collect();
        for (dt, dd) in dts.iter().zip(dds.iter()) {
            if let Some(key) = dt.value().attr("data-testid") {
                let value = node_text(*dd);
                if !value.is_empty() {
                    data.insert(key.to_string(), value);
                }
            }
        }
    }
    data
}

pub fn parse_equipment(document: &Html) -> BTreeMap<String, bool> {
    let list_sel = Selector::parse(
        "article[data-testid='vip-features-box'] ul[data-testid='vip-features-list'] li",
    )
    .unwrap();

    document
        .select(&list_sel)
        .map(node_text)
        .filter(|label| !label.is_empty())
        .map(|label| (label, true))
        .collect()
}

/// Dealer address out of the map popup. The address span sits between the
/// dealer-name `<b>` and the route link; without XPath axes we pick the
/// span that looks like a German address, falling back to the first one.
pub fn parse_location(document: &Html) -> String {
    let span_sel = Selector::parse("div[data-testid='dealer-map-info-popup'] span").unwrap();
    let spans: Vec<String> = document
        .select(&span_sel)
        .map(node_text)
        .filter(|t| !t.is_empty())
        .collect();

    spans
        .iter()
        .find(|t| POSTAL_RE.is_match(t))
        .or_else(|| spans.first())
        .cloned()
        .unwrap_or_default()
}

/// Assemble the full raw record from a rendered detail page.
pub fn parse_detail_page(html: &str, brand: &str, url: &str) -> RawListing {
    let document = Html::parse_document(html);
    RawListing {
        basic_info: parse_basic_info(&document, brand, url),
        key_features: parse_key_features(&document),
        technical_data: parse_technical_data(&document),
        equipment: parse_equipment(&document),
        scraped_at: Utc::now(),
    }
}

// ============================================================================
// Live-session workflow
// ============================================================================

/// The two site layouts change tab handling: desktop opens listings in a
/// new tab, the compact variant navigates in place. Kept as one predicate
/// so the trigger condition stays swappable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SiteLayout {
    Desktop,
    Compact,
}

pub fn detect_layout(url: &str) -> SiteLayout {
    let host = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    if host.starts_with("m.") || host.contains("/m.mobile.") {
        SiteLayout::Compact
    } else {
        SiteLayout::Desktop
    }
}

/// Clicks every "Mehr anzeigen" expander so the collapsed technical-data
/// rows make it into the DOM before it is read.
const EXPAND_BUTTONS_JS: &str = r#"
(() => {
    let clicked = 0;
    for (const btn of document.querySelectorAll('button')) {
        if (btn.textContent && btn.textContent.includes('Mehr anzeigen')) {
            btn.click();
            clicked += 1;
        }
    }
    return clicked;
})()
"#;

async fn wait_for_detail_page(
    session: &BrowserSession,
    retries: u32,
) -> Result<(), CrawlError> {
    for attempt in 1..=retries {
        if !session.wait_for_body(Duration::from_secs(15)) {
            warn!("⚠️ Detail page body missing (attempt {}/{}), refreshing", attempt, retries);
            let _ = session.refresh();
            sleep(Duration::from_secs(3)).await;
            continue;
        }

        match session.classify_current() {
            PageClass::Normal => return Ok(()),
            PageClass::Timeout => {
                warn!(
                    "⏳ Timeout page on detail view (attempt {}/{}), refreshing",
                    attempt, retries
                );
                let _ = session.refresh();
                sleep(Duration::from_secs(3)).await;
            }
            PageClass::Blocked { reference } => {
                return Err(CrawlError::AccessDenied { reference });
            }
        }
    }
    Err(CrawlError::TimeoutPage { attempts: retries })
}

fn expand_technical_sections(session: &BrowserSession) {
    match session.evaluate(EXPAND_BUTTONS_JS, false) {
        Ok(Some(value)) => {
            let clicked = value.as_i64().unwrap_or(0);
            if clicked > 0 {
                debug!("🔍 Clicked {} expand button(s)", clicked);
                stealth::human_pause(600, 1200);
            }
        }
        _ => debug!("⚠️ No expand button found"),
    }
}

async fn extract_detail(
    session: &BrowserSession,
    brand: &str,
    cfg: &CrawlerConfig,
) -> Result<RawListing, CrawlError> {
    wait_for_detail_page(session, cfg.detail_retries).await?;
    stealth::human_pause(1000, 2000);

    // Read a little of the page like a person would before touching it.
    session.human_scroll(2);
    expand_technical_sections(session);

    let url = session.current_url();
    let html = session.content()?;
    let listing = parse_detail_page(&html, brand, &url);
    info!(
        "📦 Extracted listing {} ({} - {})",
        listing.basic_info.site_id, listing.basic_info.brand, listing.basic_info.model
    );
    Ok(listing)
}

/// Open one candidate, extract its record, and restore the session to the
/// results page. `Ok(None)` means the container vanished from the DOM
/// between discovery and the click (page re-render); the listing is
/// skipped without error.
pub async fn extract_listing(
    session: &mut BrowserSession,
    candidate: &CandidateRef,
    brand: &str,
    results_url: &str,
    cfg: &CrawlerConfig,
) -> Result<Option<RawListing>, CrawlError> {
    let tabs_before_click = session.tab_count();
    {
        let Some(element) = locate_candidate(session, candidate) else {
            warn!("⚠️ Listing container #{} vanished, skipping", candidate.index);
            return Ok(None);
        };
        session
            .scroll_click(&element)
            .map_err(CrawlError::Session)?;
    }
    sleep(Duration::from_millis(1500)).await;

    let opened_new_tab = session.adopt_new_tab(tabs_before_click);
    let result = extract_detail(session, brand, cfg).await;

    // Restore the session on every path: close the detail tab (desktop) or
    // navigate back to the results page (compact). Skipped only when the
    // session is already dead from an access-denied abort.
    if opened_new_tab {
        session.close_detail_tab();
        stealth::human_pause(800, 1500);
    } else if !matches!(result, Err(CrawlError::AccessDenied { .. })) {
        if let Err(e) = session.navigate(results_url) {
            warn!("⚠️ Could not return to results page: {}", e);
        }
        stealth::human_pause(800, 1500);
    }

    result.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL_FIXTURE: &str = r#"
    <html><body>
      <h2>BMW 320d Touring M Sport</h2>
      <div data-testid="vip-price-label">35.980 €</div>
      <article data-testid="vip-key-features-box">
        <div data-testid="vip-key-features-list-item-mileage"><span>Kilometerstand</span><span>78.378 km</span></div>
        <div data-testid="vip-key-features-list-item-power"><span>Leistung</span><span>140 kW (190 PS)</span></div>
        <div data-testid="vip-key-features-list-item-fuel"><span>Kraftstoffart</span><span>Diesel</span></div>
        <div data-testid="vip-key-features-list-item-transmission"><span>Getriebe</span><span>Automatik</span></div>
        <div data-testid="vip-key-features-list-item-firstRegistration"><span>Erstzulassung</span><span>03/2018</span></div>
        <div data-testid="vip-key-features-list-item-numberOfPreviousOwners"><span>Fahrzeughalter</span><span>1</span></div>
      </article>
      <dl>
        <dt data-testid="damageCondition-item">Zustand</dt><dd>Unfallfrei</dd>
        <dt data-testid="numSeats-item">Sitzplätze</dt><dd>5</dd>
        <dt data-testid="doorCount-item">Türen</dt><dd>4/5</dd>
      </dl>
      <dl>
        <dt data-testid="hu-item">HU</dt><dd>12/2025</dd>
        <dt>Unlabeled</dt><dd>ignored</dd>
      </dl>
      <article data-testid="vip-features-box">
        <ul data-testid="vip-features-list">
          <li>ABS</li>
          <li>Sitzheizung</li>
          <li>Navigationssystem</li>
        </ul>
      </article>
      <div data-testid="dealer-map-info-popup">
        <b>Autohaus Müller GmbH</b>
        <span>Tolkewitzer Straße 83 DE-01279 Dresden</span>
        <a href="#">Route planen</a>
      </div>
    </body></html>
    "#;

    const DETAIL_URL: &str =
        "https://suchen.mobile.de/fahrzeuge/details.html?id=398765123&ref=srp";

    #[test]
    fn test_extract_site_id() {
        assert_eq!(
            extract_site_id(DETAIL_URL),
            Some("398765123".to_string())
        );
        assert_eq!(
            extract_site_id("https://www.mobile.de/auto/398111222.html"),
            Some("398111222".to_string())
        );
        assert_eq!(extract_site_id("https://www.mobile.de/bmw"), None);
    }

    #[test]
    fn test_parse_basic_info() {
        let doc = Html::parse_document(DETAIL_FIXTURE);
        let info = parse_basic_info(&doc, "BMW", DETAIL_URL);
        assert_eq!(info.brand, "BMW");
        assert_eq!(info.model, "320d Touring M Sport");
        assert_eq!(info.title, "BMW 320d Touring M Sport");
        assert_eq!(info.price_text, "35.980 €");
        assert_eq!(info.site_id, "398765123");
        assert_eq!(info.location_text, "Tolkewitzer Straße 83 DE-01279 Dresden");
    }

    #[test]
    fn test_parse_key_features_with_sentinels() {
        let doc = Html::parse_document(DETAIL_FIXTURE);
        let features = parse_key_features(&doc);
        assert_eq!(features.mileage_text, "Kilometerstand\n78.378 km");
        assert_eq!(features.first_registration_text, "Erstzulassung\n03/2018");
        assert_eq!(features.transmission_text, "Getriebe\nAutomatik");
        // Absent on this vehicle: degrade to the sentinel, never fail.
        assert_eq!(features.battery_range_text, NOT_FOUND);
        assert_eq!(features.warranty_text, NOT_FOUND);
    }

    #[test]
    fn test_parse_technical_data_pairs() {
        let doc = Html::parse_document(DETAIL_FIXTURE);
        let data = parse_technical_data(&doc);
        assert_eq!(data.get("damageCondition-item").map(String::as_str), Some("Unfallfrei"));
        assert_eq!(data.get("numSeats-item").map(String::as_str), Some("5"));
        assert_eq!(data.get("doorCount-item").map(String::as_str), Some("4/5"));
        assert_eq!(data.get("hu-item").map(String::as_str), Some("12/2025"));
        // dt without a data-testid contributes nothing.
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn test_parse_equipment_labels() {
        let doc = Html::parse_document(DETAIL_FIXTURE);
        let equipment = parse_equipment(&doc);
        assert_eq!(equipment.len(), 3);
        assert_eq!(equipment.get("ABS"), Some(&true));
        assert_eq!(equipment.get("Sitzheizung"), Some(&true));
    }

    #[test]
    fn test_empty_page_degrades_to_sentinels() {
        let listing = parse_detail_page("<html><body></body></html>", "Audi", "https://x.de/a");
        assert_eq!(listing.basic_info.title, NOT_FOUND);
        assert_eq!(listing.basic_info.price_text, NOT_FOUND);
        // No site id derivable: the URL itself keys the record.
        assert_eq!(listing.basic_info.site_id, "https://x.de/a");
        assert!(listing.technical_data.is_empty());
        assert!(listing.equipment.is_empty());
    }

    #[test]
    fn test_detect_layout() {
        assert_eq!(detect_layout("https://www.mobile.de/bmw"), SiteLayout::Desktop);
        assert_eq!(detect_layout("https://m.mobile.de/bmw"), SiteLayout::Compact);
    }

    #[test]
    fn test_model_from_title_keeps_unrelated_title() {
        assert_eq!(model_from_title("Golf VII 2.0 TDI", "Volkswagen"), "Golf VII 2.0 TDI");
        assert_eq!(model_from_title("BMW 118i", "BMW"), "118i");
    }
}

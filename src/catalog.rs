//! Brand discovery.
//!
//! The homepage carries several SEO link sections with identical markup;
//! only one of them lists used-car brands. That section is picked by
//! checking that its links collectively reference "Gebrauchtwagen", then
//! cross-referenced against the canonical make list so brands the SEO
//! block happens to omit still get a synthesized search URL. One-shot
//! parse, no retries: the homepage is stable.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::session::BrowserSession;

const BRAND_SECTION_SELECTOR: &str = "div[data-testid='home-seo-links-items']";
const BRAND_LINK_SELECTOR: &str = "a[data-testid='home-seo-link']";
const USED_CAR_SUFFIX: &str = " Gebrauchtwagen";

/// The site's make dropdown. Brands here but missing from the scraped SEO
/// block get a synthesized URL.
const CANONICAL_BRANDS: &[&str] = &[
    "Abarth", "Alfa Romeo", "Aston Martin", "Audi", "Bentley", "BMW",
    "Chevrolet", "Chrysler", "Citroen", "Cupra", "Dacia", "Daihatsu",
    "Dodge", "DS Automobiles", "Ferrari", "Fiat", "Ford", "Honda",
    "Hyundai", "Jaguar", "Jeep", "Kia", "Lada", "Lamborghini",
    "Land Rover", "Lexus", "Maserati", "Mazda", "McLaren", "Mercedes-Benz",
    "MG", "Mini", "Mitsubishi", "Nissan", "Opel", "Peugeot", "Polestar",
    "Porsche", "Renault", "Rolls-Royce", "Saab", "Seat", "Skoda", "Smart",
    "SsangYong", "Subaru", "Suzuki", "Tesla", "Toyota", "Volkswagen",
    "Volvo",
];

/// Lowercase, spaces and hyphens normalized to single hyphens.
pub fn brand_slug(brand: &str) -> String {
    brand
        .to_lowercase()
        .split(|c: char| c == ' ' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Synthesized search URL for a brand absent from the scraped link set.
pub fn synthesized_brand_url(base_url: &str, brand: &str) -> String {
    format!(
        "{}/gebrauchtwagen/{}",
        base_url.trim_end_matches('/'),
        brand_slug(brand)
    )
}

/// Parse brand -> search-URL pairs out of the homepage HTML.
pub fn parse_brand_links(html: &str) -> Result<BTreeMap<String, String>> {
    let document = Html::parse_document(html);
    let section_selector = Selector::parse(BRAND_SECTION_SELECTOR)
        .map_err(|e| anyhow!("bad section selector: {:?}", e))?;
    let link_selector = Selector::parse(BRAND_LINK_SELECTOR)
        .map_err(|e| anyhow!("bad link selector: {:?}", e))?;

    // Several sections share this markup; the used-car one is the one whose
    // link labels carry the "Gebrauchtwagen" suffix.
    let brand_section = document.select(&section_selector).find(|section| {
        section
            .select(&link_selector)
            .any(|link| link.text().collect::<String>().contains("Gebrauchtwagen"))
    });

    let section = brand_section.ok_or_else(|| anyhow!("could not find the car brands section"))?;

    let mut brands = BTreeMap::new();
    for link in section.select(&link_selector) {
        let label = link.text().collect::<String>();
        let label = label.trim();
        let brand = label.trim_end_matches(USED_CAR_SUFFIX).trim();
        if brand.is_empty() {
            continue;
        }
        if let Some(href) = link.value().attr("href") {
            brands.insert(brand.to_string(), href.to_string());
        }
    }

    if brands.is_empty() {
        return Err(anyhow!("brand section matched but contained no usable links"));
    }
    Ok(brands)
}

/// Fill in canonical brands the scraped set missed.
pub fn supplement_with_canonical(brands: &mut BTreeMap<String, String>, base_url: &str) {
    for brand in CANONICAL_BRANDS {
        if !brands.contains_key(*brand) {
            brands.insert(brand.to_string(), synthesized_brand_url(base_url, brand));
        }
    }
}

/// Discover the brand -> URL map from the live homepage.
pub fn discover_brands(
    session: &BrowserSession,
    base_url: &str,
) -> Result<BTreeMap<String, String>> {
    info!("🔍 Searching for car brand sections...");
    let html = session.content()?;
    let mut brands = parse_brand_links(&html)?;
    let scraped = brands.len();

    supplement_with_canonical(&mut brands, base_url);
    let synthesized = brands.len() - scraped;
    if synthesized > 0 {
        warn!(
            "⚠️ {} brands missing from the homepage links, synthesized their URLs",
            synthesized
        );
    }

    info!("✅ Found {} car brands ({} scraped)", brands.len(), scraped);
    Ok(brands)
}

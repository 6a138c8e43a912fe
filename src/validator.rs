//! Raw -> validated transform.
//!
//! Pure and side-effect free: raw label/value text becomes the typed
//! schema downstream ingestion consumes. A field that cannot be parsed
//! degrades to `None`; only a structurally empty record fails validation
//! as a whole (in which case the raw capture is still kept by the store).

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::extractor::{RawListing, NOT_FOUND};

/// German -> canonical equipment vocabulary. Every validated record
/// carries all of the canonical keys, present or not.
static EQUIPMENT_MAP: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("ABS", "abs"),
        ("Abstandstempomat", "adaptive_cruise_control"),
        ("Abstandswarner", "distance_warning"),
        ("Allradantrieb", "all_wheel_drive"),
        ("Ambiente-Beleuchtung", "ambient_lighting"),
        ("Android Auto", "android_auto"),
        ("Anhängerkupplung schwenkbar", "tow_bar_swiveling"),
        ("Apple CarPlay", "apple_carplay"),
        ("Armlehne", "armrest"),
        ("Beheizbare Frontscheibe", "heated_windshield"),
        ("Bluetooth", "bluetooth"),
        ("Bordcomputer", "board_computer"),
        ("Elektr. Fensterheber", "power_windows"),
        ("Elektr. Heckklappe", "power_tailgate"),
        ("Elektr. Seitenspiegel", "power_mirrors"),
        ("Elektr. Wegfahrsperre", "immobilizer"),
        ("ESP", "esp"),
        ("Fernlichtassistent", "high_beam_assist"),
        ("Freisprecheinrichtung", "hands_free"),
        ("Garantie", "warranty"),
        ("Geschwindigkeitsbegrenzer", "speed_limiter"),
        ("Induktionsladen für Smartphones", "wireless_charging"),
        ("Innenspiegel autom. abblendend", "auto_dimming_mirror"),
        ("Isofix", "isofix"),
        ("Isofix Beifahrersitz", "isofix_passenger"),
        ("Lederlenkrad", "leather_steering_wheel"),
        ("LED-Scheinwerfer", "led_headlights"),
        ("LED-Tagfahrlicht", "led_daytime_running_lights"),
        ("Leichtmetallfelgen", "alloy_wheels"),
        ("Lichtsensor", "light_sensor"),
        ("Lordosenstütze", "lumbar_support"),
        ("Müdigkeitswarner", "drowsiness_warning"),
        ("Multifunktionslenkrad", "multi_function_steering_wheel"),
        ("Musikstreaming integriert", "music_streaming"),
        ("Navigationssystem", "navigation_system"),
        ("Nichtraucher-Fahrzeug", "non_smoking_vehicle"),
        ("Notbremsassistent", "emergency_brake_assist"),
        ("Notrufsystem", "emergency_call_system"),
        ("Radio DAB", "dab_radio"),
        ("Regensensor", "rain_sensor"),
        ("Reifendruckkontrolle", "tire_pressure_monitoring"),
        ("Sitzheizung", "seat_heating"),
        ("Soundsystem", "sound_system"),
        ("Sportpaket", "sport_package"),
        ("Sportsitze", "sports_seats"),
        ("Sprachsteuerung", "voice_control"),
        ("Spurhalteassistent", "lane_keep_assist"),
        ("Touchscreen", "touchscreen"),
        ("Traktionskontrolle", "traction_control"),
        ("Tuner/Radio", "radio"),
        ("USB", "usb"),
        ("Verkehrszeichenerkennung", "traffic_sign_recognition"),
        ("Volldigitales Kombiinstrument", "digital_dashboard"),
        ("WLAN / Wifi Hotspot", "wifi_hotspot"),
        ("Zentralverriegelung", "central_locking"),
    ])
});

static DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}").unwrap());
static MONTH_YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2})/(\d{4})").unwrap());
static YEAR_MONTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})-(\d{2})").unwrap());
static KW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*kW").unwrap());
static KWH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*kWh").unwrap());
static LOCATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"DE-(\d{5})\s+([^,]+)").unwrap());

// ============================================================================
// Validated schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingInfo {
    pub brand: String,
    pub model: String,
    pub registration_year: Option<i32>,
    pub mileage: Option<i64>,
    pub city_or_postal_code: Option<String>,
    pub color: Option<String>,
    pub price: i64,
    pub currency: String,
    pub url: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalDetails {
    pub damage_condition: Option<String>,
    pub category: Option<String>,
    pub trim_line: Option<String>,
    pub country_version: Option<String>,
    pub power: Option<i32>,
    pub engine_type: Option<String>,
    pub battery_capacity: Option<f64>,
    pub battery_range: Option<i32>,
    pub num_seats: Option<i32>,
    pub door_count: Option<i32>,
    pub transmission: Option<String>,
    pub emissions_sticker: Option<String>,
    pub first_year_registration: Option<i32>,
    pub first_month_registration: Option<u32>,
    pub number_of_previous_owners: Option<i32>,
    pub hu_year: Option<i32>,
    pub hu_month: Option<u32>,
    pub climatisation: Option<String>,
    pub park_assists: Option<String>,
    pub airbags: Option<String>,
    pub manufacturer_color_name: Option<String>,
    pub interior: Option<String>,
    pub trailer_load_braked: Option<i32>,
    pub trailer_load_unbraked: Option<i32>,
    pub net_weight: Option<i32>,
    pub warranty_registration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedListing {
    pub site_id: String,
    pub listing: ListingInfo,
    pub technical_details: TechnicalDetails,
    /// Canonical key -> present. Always carries the full vocabulary.
    pub equipment: BTreeMap<String, bool>,
}

// ============================================================================
// Parsing helpers
// ============================================================================

fn clean_text(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.is_empty() || s == NOT_FOUND {
        None
    } else {
        Some(s)
    }
}

/// All digit runs concatenated: `"35.980 €"` -> 35980.
pub fn parse_price(price_text: &str) -> i64 {
    let digits: String = DIGITS_RE
        .find_iter(price_text)
        .map(|m| m.as_str())
        .collect();
    digits.parse().unwrap_or(0)
}

/// `"Kilometerstand\n78.378 km"` -> 78378, `None` when absent.
pub fn parse_mileage(mileage_text: &str) -> Option<i64> {
    let text = clean_text(mileage_text)?;
    let digits: String = DIGITS_RE.find_iter(text).map(|m| m.as_str()).collect();
    digits.parse().ok()
}

/// Weight-style figures with thousands separators: `"1.200 kg"` -> 1200.
pub fn parse_weight(weight_text: &str) -> Option<i32> {
    let text = clean_text(weight_text)?;
    let digits: String = DIGITS_RE.find_iter(text).map(|m| m.as_str()).collect();
    digits.parse().ok()
}

/// First standalone number in the text (owner counts, seat counts).
pub fn parse_int_loose(text: &str) -> Option<i32> {
    let text = clean_text(text)?;
    DIGITS_RE.find(text)?.as_str().parse().ok()
}

/// `"4/5"` doors -> 4.
pub fn parse_door_count(text: &str) -> Option<i32> {
    parse_int_loose(text)
}

/// Registration year: first 4-digit figure.
pub fn parse_registration_year(text: &str) -> Option<i32> {
    let text = clean_text(text)?;
    YEAR_RE.find(text)?.as_str().parse().ok()
}

/// `"Erstzulassung\n03/2018"` -> (Some(2018), Some(3)); a bare year
/// falls back to (Some(year), None); unparseable -> (None, None).
pub fn parse_date_components(text: &str) -> (Option<i32>, Option<u32>) {
    let Some(text) = clean_text(text) else {
        return (None, None);
    };
    if let Some(caps) = MONTH_YEAR_RE.captures(text) {
        let month = caps[1].parse().ok();
        let year = caps[2].parse().ok();
        return (year, month);
    }
    (parse_registration_year(text), None)
}

/// HU dates additionally show up as `YYYY-MM`.
pub fn parse_hu_date_components(text: &str) -> (Option<i32>, Option<u32>) {
    let Some(text) = clean_text(text) else {
        return (None, None);
    };
    if let Some(caps) = MONTH_YEAR_RE.captures(text) {
        return (caps[2].parse().ok(), caps[1].parse().ok());
    }
    if let Some(caps) = YEAR_MONTH_RE.captures(text) {
        return (caps[1].parse().ok(), caps[2].parse().ok());
    }
    (parse_registration_year(text), None)
}

/// The kW figure out of `"Leistung\n185 kW (252 PS)"`.
pub fn parse_power(text: &str) -> Option<i32> {
    let text = clean_text(text)?;
    KW_RE.captures(text)?[1].parse().ok()
}

/// `"82 kWh"` -> 82.0.
pub fn parse_battery_capacity(text: &str) -> Option<f64> {
    let text = clean_text(text)?;
    KWH_RE.captures(text)?[1].parse().ok()
}

/// First number of the range text (`"Reichweite\n500 km"` -> 500).
pub fn parse_battery_range(text: &str) -> Option<i32> {
    parse_int_loose(text)
}

/// The value line of `"Getriebe\nAutomatik"`.
pub fn parse_transmission(text: &str) -> Option<String> {
    let text = clean_text(text)?;
    let last = text.lines().last()?.trim();
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

/// `"Tolkewitzer Straße 83 DE-01279 Dresden"` -> `"01279 Dresden"`;
/// addresses without the DE- marker pass through untouched.
pub fn parse_location(location_text: &str) -> Option<String> {
    let text = clean_text(location_text)?;
    if let Some(caps) = LOCATION_RE.captures(text) {
        return Some(format!("{} {}", &caps[1], caps[2].trim()));
    }
    Some(text.to_string())
}

fn tech_value(raw: &RawListing, key: &str) -> Option<String> {
    raw.technical_data
        .get(key)
        .and_then(|v| clean_text(v))
        .map(str::to_string)
}

/// Vehicle color, preferring the plain color field and stripping the
/// " Metallic" suffix the manufacturer names carry.
pub fn extract_color(raw: &RawListing) -> Option<String> {
    let color = tech_value(raw, "color-item").or_else(|| tech_value(raw, "manufacturerColorName-item"))?;
    Some(color.replace(" Metallic", "").trim().to_string())
}

// ============================================================================
// Validator
// ============================================================================

/// Validates and transforms raw scraped car data into the typed schema.
pub struct CarDataValidator;

impl CarDataValidator {
    pub fn new() -> Self {
        Self
    }

    /// The fixed canonical vocabulary, all keys.
    pub fn canonical_equipment_keys() -> impl Iterator<Item = &'static str> {
        EQUIPMENT_MAP.values().copied()
    }

    pub fn validate(&self, raw: &RawListing) -> Result<ValidatedListing> {
        let site_id = raw.site_id().trim();
        if site_id.is_empty() {
            bail!("record has no site id to key on");
        }
        if raw.basic_info.title == NOT_FOUND && raw.basic_info.price_text == NOT_FOUND {
            bail!("record {} is structurally empty (no title, no price)", site_id);
        }

        Ok(ValidatedListing {
            site_id: site_id.to_string(),
            listing: self.validate_listing(raw),
            technical_details: self.validate_technical_details(raw),
            equipment: self.validate_equipment(raw),
        })
    }

    fn validate_listing(&self, raw: &RawListing) -> ListingInfo {
        ListingInfo {
            brand: raw.basic_info.brand.clone(),
            model: raw.basic_info.model.clone(),
            registration_year: parse_registration_year(&raw.key_features.first_registration_text),
            mileage: parse_mileage(&raw.key_features.mileage_text),
            city_or_postal_code: parse_location(&raw.basic_info.location_text),
            color: extract_color(raw),
            price: parse_price(&raw.basic_info.price_text),
            currency: "EUR".to_string(),
            url: raw.basic_info.url.clone(),
            is_active: true,
        }
    }

    fn validate_technical_details(&self, raw: &RawListing) -> TechnicalDetails {
        let features = &raw.key_features;
        let (first_year, first_month) = parse_date_components(&features.first_registration_text);
        let hu_text = tech_value(raw, "hu-item").unwrap_or_default();
        let (hu_year, hu_month) = parse_hu_date_components(&hu_text);

        // Power lives in the technical table when present, in the key
        // features box otherwise.
        let power_text = tech_value(raw, "power-item")
            .unwrap_or_else(|| features.power_text.clone());

        TechnicalDetails {
            damage_condition: tech_value(raw, "damageCondition-item"),
            category: tech_value(raw, "category-item"),
            trim_line: tech_value(raw, "trimLine-item"),
            country_version: tech_value(raw, "countryVersion-item"),
            power: parse_power(&power_text),
            engine_type: tech_value(raw, "envkv.engineType-item"),
            battery_capacity: parse_battery_capacity(
                &tech_value(raw, "batteryCapacity-item").unwrap_or_default(),
            ),
            battery_range: parse_battery_range(&features.battery_range_text),
            num_seats: parse_int_loose(&tech_value(raw, "numSeats-item").unwrap_or_default()),
            door_count: parse_door_count(&tech_value(raw, "doorCount-item").unwrap_or_default()),
            transmission: parse_transmission(&features.transmission_text),
            emissions_sticker: tech_value(raw, "emissionsSticker-item"),
            first_year_registration: first_year,
            first_month_registration: first_month,
            number_of_previous_owners: parse_int_loose(&features.previous_owners_text),
            hu_year,
            hu_month,
            climatisation: tech_value(raw, "climatisation-item"),
            park_assists: tech_value(raw, "parkAssists-item"),
            airbags: tech_value(raw, "airbag-item"),
            manufacturer_color_name: tech_value(raw, "manufacturerColorName-item"),
            interior: tech_value(raw, "interior-item"),
            trailer_load_braked: parse_weight(
                &tech_value(raw, "trailerLoadBraked-item").unwrap_or_default(),
            ),
            trailer_load_unbraked: parse_weight(
                &tech_value(raw, "trailerLoadUnbraked-item").unwrap_or_default(),
            ),
            net_weight: parse_weight(&tech_value(raw, "netWeight-item").unwrap_or_default()),
            warranty_registration: clean_text(&features.warranty_text).map(str::to_string),
        }
    }

    fn validate_equipment(&self, raw: &RawListing) -> BTreeMap<String, bool> {
        let mut equipment: BTreeMap<String, bool> = EQUIPMENT_MAP
            .values()
            .map(|key| (key.to_string(), false))
            .collect();

        for (german_label, present) in &raw.equipment {
            if !present {
                continue;
            }
            if let Some(canonical) = EQUIPMENT_MAP.get(german_label.as_str()) {
                equipment.insert(canonical.to_string(), true);
            }
        }
        equipment
    }
}

impl Default for CarDataValidator {
    fn default() -> Self {
        Self::new()
    }
}

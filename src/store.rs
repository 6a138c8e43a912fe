//! Raw / validated record sinks with site-id dedup.
//!
//! Two independent JSON array files. Both are loaded at startup so re-runs
//! are idempotent: a listing whose site id is already on disk is skipped
//! before its detail page is ever opened. A raw record is persisted before
//! validation is attempted, so a validation failure never loses the
//! capture.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::extractor::RawListing;
use crate::validator::ValidatedListing;

pub struct DedupStore {
    raw_path: PathBuf,
    validated_path: PathBuf,
    raw: Vec<RawListing>,
    validated: Vec<ValidatedListing>,
    raw_ids: BTreeSet<String>,
    validated_ids: BTreeSet<String>,
}

fn load_collection<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("parsing record collection {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn persist_collection<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

impl DedupStore {
    /// Load both collections, tolerating missing files (first run).
    pub fn open(raw_path: &Path, validated_path: &Path) -> Result<Self> {
        let raw: Vec<RawListing> = load_collection(raw_path)?;
        let validated: Vec<ValidatedListing> = load_collection(validated_path)?;

        let raw_ids = raw.iter().map(|r| r.site_id().to_string()).collect();
        let validated_ids = validated.iter().map(|v| v.site_id.clone()).collect();

        info!(
            "💾 Store opened: {} raw / {} validated records on disk",
            raw.len(),
            validated.len()
        );

        Ok(Self {
            raw_path: raw_path.to_path_buf(),
            validated_path: validated_path.to_path_buf(),
            raw,
            validated,
            raw_ids,
            validated_ids,
        })
    }

    /// Whether a raw record with this site id already persists.
    pub fn contains(&self, site_id: &str) -> bool {
        self.raw_ids.contains(site_id)
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    pub fn validated_len(&self) -> usize {
        self.validated.len()
    }

    /// Append a new raw capture. Returns false (and stores nothing) when a
    /// record with the same site id is already present.
    pub fn insert_raw(&mut self, listing: RawListing) -> Result<bool> {
        let site_id = listing.site_id().to_string();
        if self.raw_ids.contains(&site_id) {
            warn!("💾 Raw record {} already stored, skipping", site_id);
            return Ok(false);
        }

        self.raw.push(listing);
        persist_collection(&self.raw_path, &self.raw)?;
        self.raw_ids.insert(site_id);
        Ok(true)
    }

    /// Append a validated record. A validated record must always derive
    /// from a stored raw capture; anything else is a pipeline bug.
    pub fn insert_validated(&mut self, listing: ValidatedListing) -> Result<bool> {
        if !self.raw_ids.contains(&listing.site_id) {
            bail!(
                "validated record {} has no raw counterpart in the store",
                listing.site_id
            );
        }
        if self.validated_ids.contains(&listing.site_id) {
            warn!("💾 Validated record {} already stored, skipping", listing.site_id);
            return Ok(false);
        }

        let site_id = listing.site_id.clone();
        self.validated.push(listing);
        persist_collection(&self.validated_path, &self.validated)?;
        self.validated_ids.insert(site_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{BasicInfo, KeyFeatures, NOT_FOUND};
    use crate::validator::CarDataValidator;
    use std::collections::BTreeMap;

    fn raw_listing(site_id: &str) -> RawListing {
        RawListing {
            basic_info: BasicInfo {
                brand: "BMW".to_string(),
                model: "118i".to_string(),
                title: "BMW 118i".to_string(),
                price_text: "17.990 €".to_string(),
                url: format!("https://suchen.mobile.de/fahrzeuge/details.html?id={}", site_id),
                site_id: site_id.to_string(),
                location_text: "DE-10115 Berlin".to_string(),
            },
            key_features: KeyFeatures {
                mileage_text: "Kilometerstand\n45.000 km".to_string(),
                power_text: "Leistung\n100 kW (136 PS)".to_string(),
                fuel_type: "Benzin".to_string(),
                transmission_text: "Getriebe\nSchaltgetriebe".to_string(),
                first_registration_text: "Erstzulassung\n06/2019".to_string(),
                previous_owners_text: "1".to_string(),
                battery_range_text: NOT_FOUND.to_string(),
                warranty_text: NOT_FOUND.to_string(),
            },
            technical_data: BTreeMap::new(),
            equipment: BTreeMap::from([("ABS".to_string(), true)]),
            scraped_at: chrono::Utc::now(),
        }
    }

    fn temp_store(tag: &str) -> (PathBuf, PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("dedup-store-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        (dir.clone(), dir.join("raw.json"), dir.join("validated.json"))
    }

    #[test]
    fn test_dedup_idempotence_across_reopen() {
        let (dir, raw_path, validated_path) = temp_store("idem");
        let validator = CarDataValidator::new();

        {
            let mut store = DedupStore::open(&raw_path, &validated_path).unwrap();
            let raw = raw_listing("398000001");
            let validated = validator.validate(&raw).unwrap();
            assert!(store.insert_raw(raw).unwrap());
            assert!(store.insert_validated(validated).unwrap());
        }

        // Second run over the same detail page: both inserts are no-ops.
        {
            let mut store = DedupStore::open(&raw_path, &validated_path).unwrap();
            assert!(store.contains("398000001"));
            let raw = raw_listing("398000001");
            let validated = validator.validate(&raw).unwrap();
            assert!(!store.insert_raw(raw).unwrap());
            assert!(!store.insert_validated(validated).unwrap());
            assert_eq!(store.raw_len(), 1);
            assert_eq!(store.validated_len(), 1);
        }

        // Exactly one record per site id on disk, in both collections.
        let raw_json: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&raw_path).unwrap()).unwrap();
        let validated_json: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&validated_path).unwrap()).unwrap();
        assert_eq!(raw_json.len(), 1);
        assert_eq!(validated_json.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_validated_requires_raw_counterpart() {
        let (dir, raw_path, validated_path) = temp_store("orphan");
        let mut store = DedupStore::open(&raw_path, &validated_path).unwrap();

        let validated = CarDataValidator::new()
            .validate(&raw_listing("398000002"))
            .unwrap();
        assert!(store.insert_validated(validated).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_validation_failure_keeps_raw_capture() {
        let (dir, raw_path, validated_path) = temp_store("rawonly");
        let mut store = DedupStore::open(&raw_path, &validated_path).unwrap();

        let mut raw = raw_listing("398000003");
        raw.basic_info.title = NOT_FOUND.to_string();
        raw.basic_info.price_text = NOT_FOUND.to_string();

        assert!(store.insert_raw(raw.clone()).unwrap());
        assert!(CarDataValidator::new().validate(&raw).is_err());

        assert_eq!(store.raw_len(), 1);
        assert_eq!(store.validated_len(), 0);
        assert!(raw_path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}

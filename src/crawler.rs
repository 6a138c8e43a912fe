//! Crawl orchestration.
//!
//! One sequential worker drives the browser through brand discovery,
//! pagination and extraction; the access-denied monitor is the only
//! concurrent piece. An `AccessDenied` anywhere unwinds through here,
//! the session is torn down on every path, and the caller decides what
//! happens to the proxy.

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::catalog;
use crate::config::CrawlerConfig;
use crate::error::CrawlError;
use crate::extractor::{self, detect_layout, RawListing};
use crate::monitor::{AccessDeniedMonitor, PageClass};
use crate::pacing::{PacingAction, PacingController};
use crate::paginator::{self, BrandStep, PageCursor};
use crate::proxy::Proxy;
use crate::session::BrowserSession;
use crate::store::DedupStore;
use crate::validator::CarDataValidator;

#[derive(Debug, Default)]
pub struct CrawlStats {
    pub brands_processed: u64,
    pub pages_visited: u64,
    pub listings_extracted: u64,
    pub duplicates_skipped: u64,
    pub validated: u64,
    pub validation_failures: u64,
    pub timeouts_skipped: u64,
}

impl CrawlStats {
    pub fn log_summary(&self, elapsed: Duration) {
        info!(
            "📊 Crawl summary: {} brands, {} pages, {} extracted, {} validated, \
             {} duplicates skipped, {} validation failures, {} timeout skips in {:?}",
            self.brands_processed,
            self.pages_visited,
            self.listings_extracted,
            self.validated,
            self.duplicates_skipped,
            self.validation_failures,
            self.timeouts_skipped,
            elapsed
        );
    }
}

/// Run one full crawl attempt under the given proxy (or a direct
/// connection). The browser session and the monitor are closed on every
/// exit path, success or failure.
pub async fn run_crawl(
    cfg: &CrawlerConfig,
    proxy: Option<&Proxy>,
    expected_ip: Option<&str>,
    store: &mut DedupStore,
) -> Result<CrawlStats, CrawlError> {
    let started = Instant::now();
    let mut stats = CrawlStats::default();

    info!("🚗 Creating browser session...");
    let mut session = BrowserSession::launch(cfg, proxy).map_err(|e| match proxy {
        Some(proxy) => CrawlError::ProxyFailure(format!("{}: {:#}", proxy.label(), e)),
        None => CrawlError::Session(e),
    })?;

    if let Err(e) = session.verify_ip(expected_ip) {
        warn!("⚠️ Browser-side IP verification failed: {:#}", e);
    }

    let mut monitor = AccessDeniedMonitor::spawn(
        session.monitor_tab(),
        Duration::from_secs(cfg.monitor_interval_secs),
    );

    let result = crawl_site(cfg, proxy, store, &mut session, &monitor, &mut stats).await;

    // Cleanup happens here regardless of outcome; Drop covers panics too.
    monitor.stop();
    drop(session);

    match result {
        Ok(()) => {
            stats.log_summary(started.elapsed());
            Ok(stats)
        }
        Err(e) => {
            stats.log_summary(started.elapsed());
            Err(e)
        }
    }
}

async fn crawl_site(
    cfg: &CrawlerConfig,
    proxy: Option<&Proxy>,
    store: &mut DedupStore,
    session: &mut BrowserSession,
    monitor: &AccessDeniedMonitor,
    stats: &mut CrawlStats,
) -> Result<(), CrawlError> {
    let mut pacing = PacingController::new(cfg);
    let validator = CarDataValidator::new();

    info!("🌐 Navigating to {}...", cfg.base_url);
    session.navigate(&cfg.base_url)?;
    pacing.pause_after_navigation().await;

    if let PageClass::Blocked { reference } = session.classify_current() {
        return Err(CrawlError::AccessDenied { reference });
    }

    let brands = catalog::discover_brands(&*session, &cfg.base_url)?;

    for (brand, url) in &brands {
        // Checkpoint: before each brand.
        monitor.check()?;

        info!("🚙 Processing brand: {}", brand);
        match crawl_brand(
            cfg, proxy, store, session, monitor, &mut pacing, &validator, stats, brand, url,
        )
        .await
        {
            Ok(()) => {
                stats.brands_processed += 1;
                info!("✅ Finished brand {}", brand);
            }
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => warn!("⚠️ Brand {} abandoned: {}", brand, e),
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn crawl_brand(
    cfg: &CrawlerConfig,
    proxy: Option<&Proxy>,
    store: &mut DedupStore,
    session: &mut BrowserSession,
    monitor: &AccessDeniedMonitor,
    pacing: &mut PacingController,
    validator: &CarDataValidator,
    stats: &mut CrawlStats,
    brand: &str,
    url: &str,
) -> Result<(), CrawlError> {
    pacing.start_brand();

    session.navigate(url)?;
    pacing.pause_after_navigation().await;

    // Block pages love to replace the first brand page; check explicitly
    // before trusting anything on it.
    match session.classify_current() {
        PageClass::Blocked { reference } => {
            return Err(CrawlError::AccessDenied { reference });
        }
        PageClass::Timeout => {
            warn!("⏳ Brand page timed out, one refresh before giving up");
            let _ = session.refresh();
            sleep(Duration::from_secs(3)).await;
            if session.classify_current() != PageClass::Normal {
                warn!("⚠️ Brand page unreachable, skipping {}", brand);
                return Ok(());
            }
        }
        PageClass::Normal => {}
    }

    let layout = detect_layout(&session.current_url());
    debug!("Layout for {}: {:?}", brand, layout);

    let mut cursor = PageCursor::new(cfg.max_pages, cfg.empty_page_threshold);
    let mut processed_in_brand: u32 = 0;

    loop {
        stats.pages_visited += 1;
        // Nudge lazy-loaded cards into the DOM before counting them.
        session.human_scroll(1);

        let candidates = paginator::collect_candidates(&*session);
        let next_enabled = paginator::has_enabled_next(&*session);

        match cursor.note_results(candidates.len(), next_enabled) {
            BrandStep::End(reason) => {
                info!("🏁 Pagination for {} ended on page {} ({:?})", brand, cursor.page(), reason);
                return Ok(());
            }
            BrandStep::Continue => {}
        }

        if !candidates.is_empty() {
            info!(
                "✅ Found {} listings for {} on page {}",
                candidates.len(),
                brand,
                cursor.page()
            );
        }

        let results_url = session.current_url();
        for candidate in &candidates {
            // Cheap pre-dedup from the container's own testid: skip without
            // ever opening the detail page.
            if let Some(site_id) = &candidate.site_id {
                if store.contains(site_id) {
                    debug!("💾 Listing {} already stored, skipping", site_id);
                    stats.duplicates_skipped += 1;
                    continue;
                }
            }

            processed_in_brand += 1;
            // Checkpoint: every 5 listings via the monitor flag...
            if processed_in_brand % 5 == 0 {
                monitor.check()?;
            }
            // ...and every 50 listings an explicit content re-check.
            if processed_in_brand % 50 == 0 {
                if let PageClass::Blocked { reference } = session.classify_current() {
                    return Err(CrawlError::AccessDenied { reference });
                }
            }

            match extractor::extract_listing(session, candidate, brand, &results_url, cfg).await {
                Ok(Some(raw)) => {
                    stats.listings_extracted += 1;
                    record_listing(store, validator, raw, stats)?;
                }
                Ok(None) => continue,
                Err(CrawlError::TimeoutPage { attempts }) => {
                    warn!(
                        "⏳ Listing skipped after {} timed-out load attempts",
                        attempts
                    );
                    stats.timeouts_skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            match pacing.record_processed() {
                PacingAction::Continue => pacing.pause_between_listings().await,
                PacingAction::Cooldown => pacing.cooldown(monitor).await?,
                PacingAction::RotateIp => {
                    rotate_proxy_ip(proxy, cfg).await;
                    pacing.cooldown(monitor).await?;
                }
            }
        }

        let url_before = session.current_url();
        let clicked = paginator::click_next(&*session).map_err(CrawlError::Session)?;
        if clicked {
            pacing.pause_after_navigation().await;
        }
        let url_after = session.current_url();

        match cursor.note_advance(&url_before, &url_after, clicked) {
            BrandStep::Continue => {}
            BrandStep::End(reason) => {
                info!("🏁 Pagination for {} ended on page {} ({:?})", brand, cursor.page(), reason);
                return Ok(());
            }
        }
    }
}

/// Raw capture first, validation second: a validation failure leaves the
/// raw record in place and the validated store untouched.
fn record_listing(
    store: &mut DedupStore,
    validator: &CarDataValidator,
    raw: RawListing,
    stats: &mut CrawlStats,
) -> Result<(), CrawlError> {
    if store.contains(raw.site_id()) {
        stats.duplicates_skipped += 1;
        return Ok(());
    }

    let site_id = raw.site_id().to_string();
    let validated = validator.validate(&raw);

    store.insert_raw(raw)?;

    match validated {
        Ok(validated) => {
            store.insert_validated(validated)?;
            stats.validated += 1;
        }
        Err(e) => {
            warn!("❌ Validation failed for {} (raw record kept): {:#}", site_id, e);
            stats.validation_failures += 1;
        }
    }
    Ok(())
}

/// Rotation milestone: ask the proxy provider for a fresh exit IP. Best
/// effort, never fatal; a direct connection has nothing to rotate.
async fn rotate_proxy_ip(proxy: Option<&Proxy>, cfg: &CrawlerConfig) {
    let Some(proxy) = proxy else {
        debug!("No proxy in use, nothing to rotate");
        return;
    };
    info!("🔁 Rotation milestone reached, requesting fresh IP from {}", proxy.label());
    match proxy
        .change_ip(Duration::from_secs(cfg.probe_timeout_secs))
        .await
    {
        Ok(_) => {}
        Err(e) => error!("❌ IP rotation attempt failed: {:#}", e),
    }
}

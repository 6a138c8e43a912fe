//! Crawl pacing: cooldowns, rotation milestones, inter-action jitter.
//!
//! The sleeps here are not incidental latency, they are behavioral cover
//! against rate profiling and a correctness requirement of the crawl.
//! Cooldowns never sleep blindly: they tick in short slices and poll the
//! access-denied flag so a mid-pause block aborts the session promptly.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::info;

use crate::config::CrawlerConfig;
use crate::error::CrawlError;
use crate::monitor::AccessDeniedMonitor;

/// What the controller wants after one more listing was processed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacingAction {
    Continue,
    /// Pause for the configured cooldown before the next listing.
    Cooldown,
    /// Larger milestone: ask the proxy for a fresh exit IP, then pause.
    RotateIp,
}

#[derive(Debug)]
pub struct PacingController {
    cooldown_after: u32,
    rotate_after: u32,
    cooldown: Duration,
    since_cooldown: u32,
    since_rotation: u32,
    total_processed: u64,
}

impl PacingController {
    pub fn new(cfg: &CrawlerConfig) -> Self {
        Self {
            cooldown_after: cfg.cooldown_after.max(1),
            rotate_after: cfg.rotate_after.max(1),
            cooldown: Duration::from_secs(cfg.cooldown_secs),
            since_cooldown: 0,
            since_rotation: 0,
            total_processed: 0,
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    /// Account for one processed listing. The rotation milestone takes
    /// precedence when both trip on the same listing; either way the
    /// rolling cooldown counter restarts at zero.
    pub fn record_processed(&mut self) -> PacingAction {
        self.total_processed += 1;
        self.since_cooldown += 1;
        self.since_rotation += 1;

        if self.since_rotation >= self.rotate_after {
            self.since_rotation = 0;
            self.since_cooldown = 0;
            return PacingAction::RotateIp;
        }
        if self.since_cooldown >= self.cooldown_after {
            self.since_cooldown = 0;
            return PacingAction::Cooldown;
        }
        PacingAction::Continue
    }

    /// Fresh brand, fresh rolling counter.
    pub fn start_brand(&mut self) {
        self.since_cooldown = 0;
    }

    /// The multi-minute pause, sliced so the monitor flag is observed
    /// within seconds rather than at the end of the pause.
    pub async fn cooldown(&self, monitor: &AccessDeniedMonitor) -> Result<(), CrawlError> {
        info!(
            "⏳ Cooldown reached. Pausing for {}s...",
            self.cooldown.as_secs()
        );
        let slice = Duration::from_secs(5);
        let mut remaining = self.cooldown;
        while remaining > Duration::ZERO {
            monitor.check()?;
            let step = remaining.min(slice);
            sleep(step).await;
            remaining -= step;
        }
        monitor.check()?;
        info!("▶️ Cooldown finished, resuming");
        Ok(())
    }

    /// Jittered pause after a navigation settles.
    pub async fn pause_after_navigation(&self) {
        jitter_sleep(2_000, 4_500).await;
    }

    /// Jittered pause between two listings on the same page.
    pub async fn pause_between_listings(&self) {
        jitter_sleep(3_000, 7_000).await;
    }

    /// Short pause after tab bookkeeping (open/close/switch).
    pub async fn pause_after_tab_switch(&self) {
        jitter_sleep(1_000, 2_500).await;
    }
}

async fn jitter_sleep(min_ms: u64, max_ms: u64) {
    let ms = { rand::thread_rng().gen_range(min_ms..=max_ms) };
    sleep(Duration::from_millis(ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(cooldown_after: u32, rotate_after: u32) -> PacingController {
        let mut cfg = CrawlerConfig::from_env();
        cfg.cooldown_after = cooldown_after;
        cfg.rotate_after = rotate_after;
        cfg.cooldown_secs = 1;
        PacingController::new(&cfg)
    }

    #[test]
    fn test_cooldown_counter_resets_after_trigger() {
        let mut pacing = controller(3, 100);

        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Cooldown);

        // Counter is back at zero: no second cooldown before 3 more.
        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Cooldown);
    }

    #[test]
    fn test_rotation_milestone_takes_precedence() {
        let mut pacing = controller(2, 4);

        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Cooldown);
        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        // Listing 4 hits both thresholds; rotation wins.
        assert_eq!(pacing.record_processed(), PacingAction::RotateIp);
        // And it also restarted the cooldown ledger.
        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Cooldown);
    }

    #[test]
    fn test_brand_start_resets_rolling_counter() {
        let mut pacing = controller(3, 100);
        pacing.record_processed();
        pacing.record_processed();
        pacing.start_brand();
        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Continue);
        assert_eq!(pacing.record_processed(), PacingAction::Cooldown);
    }

    #[test]
    fn test_total_processed_accumulates() {
        let mut pacing = controller(10, 100);
        for _ in 0..7 {
            pacing.record_processed();
        }
        assert_eq!(pacing.total_processed(), 7);
    }
}

mod catalog;
mod config;
mod crawler;
mod error;
mod extractor;
mod monitor;
mod pacing;
mod paginator;
mod proxy;
mod session;
mod stealth;
mod store;
mod validator;

use std::time::{Duration, Instant};

use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CrawlerConfig;
use crate::proxy::ProxyPool;
use crate::store::DedupStore;

/// Section headers in the run log.
fn log_section(title: &str) {
    info!("\n{}\n{}\n{}", "=".repeat(50), title, "=".repeat(50));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let started = Instant::now();
    let cfg = CrawlerConfig::from_env();

    let mut store = DedupStore::open(&cfg.raw_store, &cfg.validated_store)?;

    log_section("PROXY TESTING");
    info!("📋 Reading proxy list...");
    let mut pool = ProxyPool::load(&cfg.proxy_file)?;

    let probe_timeout = Duration::from_secs(cfg.probe_timeout_secs);
    let mut completed = false;

    while let Some(candidate) = pool.take_next() {
        info!(
            "🔍 Testing proxy {} ({} left in pool)",
            candidate.label(),
            pool.remaining()
        );

        let observed_ip = match candidate.probe(probe_timeout).await {
            Ok(ip) => {
                info!("✅ Proxy check successful. IP: {}", ip);
                ip
            }
            Err(e) => {
                error!("❌ {}", e);
                pool.retire(&candidate, "probe failed");
                continue;
            }
        };

        log_section("STARTING CRAWL");
        match crawler::run_crawl(&cfg, Some(&candidate), Some(observed_ip.as_str()), &mut store).await {
            Ok(_) => {
                completed = true;
                break;
            }
            Err(e) => {
                error!("❌ Crawl attempt through {} failed: {}", candidate.label(), e);
                if e.should_retire_proxy() {
                    pool.retire(&candidate, &e.to_string());
                }
            }
        }
    }

    if !completed {
        warn!("⚠️ All proxies failed or none configured. Running with direct connection.");
        log_section("STARTING CRAWL (DIRECT CONNECTION)");
        if let Err(e) = crawler::run_crawl(&cfg, None, None, &mut store).await {
            error!("❌ Direct-connection crawl failed: {}", e);
        }
    }

    info!(
        "💾 Store now holds {} raw / {} validated records",
        store.raw_len(),
        store.validated_len()
    );
    info!("⏱️ Total execution time: {:?}", started.elapsed());
    Ok(())
}

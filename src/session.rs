//! Browser session control.
//!
//! One Chrome process per crawl attempt, exclusively owned by that attempt:
//! proxy wiring (including the auth extension for credentialed proxies),
//! per-session user agent, stealth injection, tolerant DOM lookup and tab
//! management. Teardown is guaranteed on every exit path through `Drop`,
//! including when creation itself partially failed.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use crate::config::CrawlerConfig;
use crate::proxy::{generate_proxy_auth_extension, Proxy};
use crate::stealth;

/// URL returning the caller's public IP as plain text (browser-side check).
const IP_ECHO_URL: &str = "https://api.ipify.org";

pub struct BrowserSession {
    browser: Browser,
    main_tab: Arc<Tab>,
    detail_tab: Option<Arc<Tab>>,
    pub user_agent: String,
    ext_dir: Option<PathBuf>,
}

impl BrowserSession {
    /// Launch a Chrome instance wired to the given proxy (or none).
    pub fn launch(cfg: &CrawlerConfig, proxy: Option<&Proxy>) -> Result<Self> {
        let mut ext_dir: Option<PathBuf> = None;
        match Self::launch_inner(cfg, proxy, &mut ext_dir) {
            Ok(session) => Ok(session),
            Err(e) => {
                // Creation failed halfway: the extension dir is the only
                // resource not owned by a Drop yet.
                if let Some(dir) = ext_dir {
                    let _ = std::fs::remove_dir_all(dir);
                }
                Err(e)
            }
        }
    }

    fn launch_inner(
        cfg: &CrawlerConfig,
        proxy: Option<&Proxy>,
        ext_dir: &mut Option<PathBuf>,
    ) -> Result<Self> {
        let user_agent = stealth::pick_user_agent().to_string();

        let mut args: Vec<String> = [
            "--disable-blink-features=AutomationControlled",
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-infobars",
            "--window-position=0,0",
            "--ignore-certificate-errors",
            "--incognito",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push(format!("--user-agent={}", user_agent));
        if cfg.headless {
            args.push("--headless=new".to_string());
        }

        if let Some(proxy) = proxy {
            info!("🔌 Wiring session through proxy {}", proxy.label());
            args.push(format!("--proxy-server={}", proxy.to_chrome_arg()));

            if proxy.requires_auth() {
                let dir = generate_proxy_auth_extension(
                    proxy.username.as_deref().unwrap_or_default(),
                    proxy.password.as_deref().unwrap_or_default(),
                )?;
                args.push(format!("--load-extension={}", dir.display()));
                *ext_dir = Some(dir);
                info!("🔐 Proxy auth extension loaded");
            }
        } else {
            info!("🔌 No proxy provided, using direct connection");
        }

        let arg_refs: Vec<&OsStr> = args.iter().map(|s| OsStr::new(s.as_str())).collect();

        let browser = Browser::new(LaunchOptions {
            headless: false, // modern headless goes through --headless=new
            window_size: Some((cfg.window_width, cfg.window_height)),
            args: arg_refs,
            // Cooldowns outlast the 30s default; don't let Chrome die under us.
            idle_browser_timeout: Duration::from_secs(cfg.cooldown_secs.max(120) * 3),
            ..Default::default()
        })
        .context("launching Chrome")?;

        let main_tab = browser.new_tab().context("opening main tab")?;

        // Stealth script must be registered before the first navigation.
        main_tab.enable_debugger()?;
        main_tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
            source: stealth::stealth_script(),
            world_name: None,
            include_command_line_api: None,
            run_immediately: None,
        })?;

        Ok(Self {
            browser,
            main_tab,
            detail_tab: None,
            user_agent,
            ext_dir: ext_dir.take(),
        })
    }

    /// The tab the workflow is currently reading: the detail tab when one
    /// is open, the results tab otherwise.
    pub fn active_tab(&self) -> &Arc<Tab> {
        self.detail_tab.as_ref().unwrap_or(&self.main_tab)
    }

    /// Clone of the main-tab handle for the background monitor.
    pub fn monitor_tab(&self) -> Arc<Tab> {
        self.main_tab.clone()
    }

    pub fn navigate(&self, url: &str) -> Result<()> {
        let tab = self.active_tab();
        tab.navigate_to(url)
            .with_context(|| format!("navigating to {}", url))?;
        tab.wait_until_navigated()
            .with_context(|| format!("waiting for {}", url))?;
        Ok(())
    }

    pub fn current_url(&self) -> String {
        self.active_tab().get_url()
    }

    pub fn title(&self) -> String {
        self.active_tab().get_title().unwrap_or_default()
    }

    pub fn content(&self) -> Result<String> {
        self.active_tab().get_content().context("reading page content")
    }

    /// Soft page-readiness check: body present within the timeout.
    pub fn wait_for_body(&self, timeout: Duration) -> bool {
        self.active_tab()
            .wait_for_element_with_custom_timeout("body", timeout)
            .is_ok()
    }

    /// Reload the active tab (used on timeout-classified pages).
    pub fn refresh(&self) -> Result<()> {
        self.active_tab().reload(true, None)?;
        Ok(())
    }

    /// Try each selector strategy in order and merge the matches. The site's
    /// markup is not consistently annotated, so a later strategy acts as a
    /// safety net when an earlier one stops matching.
    pub fn find_all<'a>(&'a self, selectors: &[&str]) -> Vec<Element<'a>> {
        let tab = self.active_tab();
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for selector in selectors {
            let found = tab.find_elements(selector).unwrap_or_else(|_| Vec::new());
            for element in found {
                if seen.insert(element.node_id) {
                    merged.push(element);
                }
            }
        }
        merged
    }

    /// Scroll the node into view and click it. Overlays on the site
    /// intercept interactive clicks now and then; the DOM-level click is
    /// the fallback.
    pub fn scroll_click(&self, element: &Element) -> Result<()> {
        element.scroll_into_view()?;
        stealth::human_pause(300, 900);
        if let Err(e) = element.click() {
            debug!("Interactive click intercepted ({}), using DOM-level click", e);
            element.call_js_fn("function() { this.click(); }", vec![], false)?;
        }
        Ok(())
    }

    /// Evaluate a script on the active tab and return its JSON value.
    pub fn evaluate(&self, script: &str, await_promise: bool) -> Result<Option<serde_json::Value>> {
        let result = self.active_tab().evaluate(script, await_promise)?;
        Ok(result.value)
    }

    /// Scroll the active tab down in human-paced viewport steps.
    pub fn human_scroll(&self, steps: u32) {
        for _ in 0..steps {
            let _ = self.evaluate(stealth::SCROLL_STEP_JS, false);
            stealth::human_pause(400, 900);
        }
    }

    /// Number of tabs the browser currently tracks. Sampled before a click
    /// so [`adopt_new_tab`](Self::adopt_new_tab) can tell whether the click
    /// spawned one.
    pub fn tab_count(&self) -> usize {
        self.browser
            .get_tabs()
            .lock()
            .map(|tabs| tabs.len())
            .unwrap_or(0)
    }

    /// Whether the last click spawned a new tab; if so, adopt it as the
    /// detail tab (desktop layout). Returns false for the compact layout
    /// where the click navigated in place.
    pub fn adopt_new_tab(&mut self, count_before_click: usize) -> bool {
        let tabs: Vec<Arc<Tab>> = match self.browser.get_tabs().lock() {
            Ok(tabs) => tabs.iter().cloned().collect(),
            Err(_) => return false,
        };
        if tabs.len() > count_before_click {
            if let Some(tab) = tabs.last() {
                debug!("🔄 Click opened a new tab, switching to it");
                self.detail_tab = Some(tab.clone());
                return true;
            }
        }
        false
    }

    /// Close the detail tab (if any) and fall back to the results tab.
    pub fn close_detail_tab(&mut self) {
        if let Some(tab) = self.detail_tab.take() {
            if let Err(e) = tab.close(true) {
                warn!("⚠️ Failed to close detail tab: {}", e);
            }
        }
    }

    /// Classify whatever the active tab currently shows.
    pub fn classify_current(&self) -> crate::monitor::PageClass {
        let title = self.title();
        let content = self.content().unwrap_or_default();
        crate::monitor::classify_page(&title, &content)
    }

    /// Browser-side proxy verification: load the IP echo page and compare
    /// what the site sees against what the probe observed.
    pub fn verify_ip(&self, expected: Option<&str>) -> Result<String> {
        self.navigate(IP_ECHO_URL)?;
        let element = self
            .active_tab()
            .wait_for_element_with_custom_timeout("pre", Duration::from_secs(15))
            .context("IP echo page did not render")?;
        let observed = element.get_inner_text()?.trim().to_string();

        match expected {
            Some(expected) if expected == observed => {
                info!("🔒 Proxy verified in-browser ({})", observed);
            }
            Some(expected) => {
                warn!(
                    "⚠️ PROXY MISMATCH! Probe saw {} but browser egress is {}",
                    expected, observed
                );
            }
            None => info!("🌐 Browser egress IP: {}", observed),
        }
        Ok(observed)
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(tab) = self.detail_tab.take() {
            let _ = tab.close(true);
        }
        if let Some(dir) = self.ext_dir.take() {
            let _ = std::fs::remove_dir_all(dir);
        }
        // The Chrome process itself dies with `Browser`.
    }
}

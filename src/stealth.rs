//! Stealth & obfuscation helpers.
//!
//! - navigator hardening script injected before any page script runs
//! - rotating desktop user-agent pool
//! - human-paced scrolling/typing primitives

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/123.0.0.0 Safari/537.36",
    ]
});

/// Pick a user agent for one browser session.
pub fn pick_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Generate the stealth injection script, run before any other script on
/// the page (via Page.addScriptToEvaluateOnNewDocument).
pub fn stealth_script() -> String {
    let base_script = r#"
        // 1. Unmasking: Remove `navigator.webdriver`
        Object.defineProperty(navigator, 'webdriver', {
            get: () => undefined,
        });

        // 2. Hardware Concurrency Spoofing (Randomize 4-16)
        Object.defineProperty(navigator, 'hardwareConcurrency', {
            get: () => 4 + Math.floor(Math.random() * 4) * 2,
        });

        // 3. Memory Spoofing (Randomize 4-32 GB)
        Object.defineProperty(navigator, 'deviceMemory', {
            get: () => 4 + Math.floor(Math.random() * 4) * 4,
        });

        // 4. Chrome Runtime Mocking (Essential for "headless" checks)
        window.chrome = {
            runtime: {
                connect: function() {
                    return {
                        onMessage: { addListener: function() {}, removeListener: function() {} },
                        postMessage: function() {},
                        disconnect: function() {}
                    };
                },
                sendMessage: function() {},
                onMessage: { addListener: function() {}, removeListener: function() {} },
                id: "pkghijhgljhglijhglijhglijhglij"
            },
            app: { isInstalled: false },
            csi: function() {},
            loadTimes: function() {
                return {
                    commitLoadTime: Math.random(),
                    finishDocumentLoadTime: Math.random() * 10,
                    finishLoadTime: Math.random() * 10,
                    navigationType: "Other",
                    npnNegotiatedProtocol: "h2",
                    connectionInfo: "h2"
                };
            }
        };

        // 5. Permission Mocking (Notifications = default/denied, not 'prompt')
        const originalQuery = window.navigator.permissions.query;
        window.navigator.permissions.query = (parameters) => (
            parameters.name === 'notifications' ?
            Promise.resolve({ state: Notification.permission }) :
            originalQuery(parameters)
        );

        // 6. Spoof Plugins (Standard Chrome Set)
        Object.defineProperty(navigator, 'plugins', {
            get: () => {
                const pdf = {
                    0: { type: "application/x-google-chrome-pdf", suffixes: "pdf", description: "Portable Document Format" },
                    description: "Portable Document Format",
                    filename: "internal-pdf-viewer",
                    length: 1,
                    name: "Chrome PDF Plugin"
                };
                const p = [pdf, pdf, pdf, pdf, pdf];
                Object.setPrototypeOf(p, PluginArray.prototype);
                return p;
            }
        });

        // 7. WebGL Vendor Spoofing
        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {
            if (parameter === 37445) return 'Intel Inc.';
            if (parameter === 37446) return 'Intel Iris OpenGL Engine';
            return getParameter.apply(this, [parameter]);
        };
    "#;

    base_script.to_string()
}

/// JS fragment scrolling one viewport step down, called repeatedly from the
/// Rust side so the pacing stays on this end.
pub const SCROLL_STEP_JS: &str = "window.scrollBy(0, window.innerHeight * 0.8);";

/// A short randomized pause between DOM interactions (post-click,
/// post-scroll). Blocking on purpose: the main worker is serial and the
/// pause IS the behavior being simulated.
pub fn human_pause(min_ms: u64, max_ms: u64) {
    let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
    std::thread::sleep(Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stealth_script_generation() {
        let script = stealth_script();
        assert!(script.contains("Object.defineProperty(navigator, 'webdriver'"));
        assert!(script.contains("window.chrome = {"));
        assert!(script.contains("PluginArray.prototype"));
    }

    #[test]
    fn test_user_agent_pool() {
        let ua = pick_user_agent();
        assert!(ua.starts_with("Mozilla/5.0"));
    }
}

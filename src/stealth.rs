//! Process-wide stealth assets: the init script injected into every browser
//! context before navigation, anti-automation launch flags, and the
//! tracker/resource blocklists used by the browser tier.

/// Injected before any page script runs. Opaque to the engine; the only
/// guarantee the engine relies on is that it executes first.
pub const STEALTH_INIT_SCRIPT: &str = r#"
(() => {
  Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
  if (!window.chrome) {
    window.chrome = { runtime: {} };
  }
  Object.defineProperty(navigator, 'languages', { get: () => ['pt-BR', 'pt', 'en-US', 'en'] });
  Object.defineProperty(navigator, 'plugins', {
    get: () => [1, 2, 3, 4, 5].map(() => ({ name: 'Chromium PDF Plugin' })),
  });
  const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
  if (originalQuery) {
    window.navigator.permissions.query = (parameters) =>
      parameters.name === 'notifications'
        ? Promise.resolve({ state: Notification.permission })
        : originalQuery(parameters);
  }
  const getParameter = WebGLRenderingContext.prototype.getParameter;
  WebGLRenderingContext.prototype.getParameter = function (parameter) {
    if (parameter === 37445) return 'Intel Inc.';
    if (parameter === 37446) return 'Intel Iris OpenGL Engine';
    return getParameter.call(this, parameter);
  };
})();
"#;

/// Chromium flags that suppress the most common automation tells.
pub const STEALTH_LAUNCH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-infobars",
    "--disable-dev-shm-usage",
    "--disable-background-networking",
    "--disable-features=TranslateUI,IsolateOrigins,site-per-process",
];

/// Script hosts aborted by the browser tier's request interception.
pub const TRACKER_BLOCKLIST: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "connect.facebook.net",
    "hotjar.com",
    "fullstory.com",
    "segment.com",
    "segment.io",
    "mixpanel.com",
    "amplitude.com",
    "sentry.io",
    "clarity.ms",
    "doubleclick.net",
    "adnxs.com",
    "criteo.com",
    "taboola.com",
    "outbrain.com",
];

/// URL patterns for resource types the browser tier never needs.
pub const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.svg", "*.ico", "*.webp", "*.woff", "*.woff2",
    "*.ttf", "*.eot", "*.otf", "*.mp3", "*.mp4", "*.webm", "*.avi", "*.mov",
];

/// Realistic desktop user agent for the HTTP tiers and the spoofed context.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";

/// Patterns in URLs that the interceptor treats as blockable script hosts.
pub fn is_tracker_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    TRACKER_BLOCKLIST.iter().any(|host| lower.contains(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_urls_are_flagged() {
        assert!(is_tracker_url("https://www.google-analytics.com/ga.js"));
        assert!(is_tracker_url("https://cdn.segment.com/analytics.js"));
        assert!(!is_tracker_url("https://example.com/app.js"));
    }

    #[test]
    fn init_script_is_self_contained() {
        assert!(STEALTH_INIT_SCRIPT.contains("navigator"));
        assert!(STEALTH_INIT_SCRIPT.trim_start().starts_with("(()"));
    }
}

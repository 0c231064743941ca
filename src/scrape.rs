//! Tiered scraper cascade: plain HTTP, stealth-header HTTP, and a headless
//! browser tier, all feeding the shared content extractor behind the URL
//! safety layer. Escalation is driven by thin or shell-like results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::Html;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::{FetchedPage, StaticFetch};
use crate::config::Cookie;
use crate::driver::{BrowserHandle, BrowserLauncher, LoadState, PageOptions};
use crate::error::AgentError;
use crate::extract::{self, ExtractedContent};
use crate::safety::{self, Resolve, SystemResolver};
use crate::ssr;
use crate::stealth::{BLOCKED_RESOURCE_PATTERNS, DESKTOP_USER_AGENT, STEALTH_INIT_SCRIPT, TRACKER_BLOCKLIST};

/// A result with less markdown than this (and no SSR payload) escalates to
/// the next tier.
const MIN_MARKDOWN_CHARS: usize = 200;
const STEALTH_TIMEOUT_MS: u64 = 30_000;
const STEALTH_RETRIES: u32 = 2;
const NAV_RETRY_DELAY_MS: u64 = 1_500;
const NETWORK_IDLE_CAP_MS: u64 = 15_000;
const WAIT_SELECTOR_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SCRAPE_CONCURRENCY: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeTier {
    Http,
    Stealth,
    Browser,
}

impl ScrapeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeTier::Http => "http",
            ScrapeTier::Stealth => "stealth",
            ScrapeTier::Browser => "browser",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScrapeOptions {
    pub force_tier: Option<ScrapeTier>,
    /// Extract only the main article body instead of the whole page.
    pub main_only: bool,
    pub timeout_ms: u64,
    pub wait_for_selector: Option<String>,
    pub capture_api_responses: bool,
    /// Seeded into the browser-tier context before navigation.
    pub cookies: Vec<Cookie>,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            force_tier: None,
            main_only: true,
            timeout_ms: STEALTH_TIMEOUT_MS,
            wait_for_selector: None,
            capture_api_responses: false,
            cookies: Vec::new(),
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScrapeResult {
    pub url: String,
    pub tier: ScrapeTier,
    pub status_code: u16,
    pub title: Option<String>,
    pub description: Option<String>,
    pub html: String,
    pub text: String,
    pub markdown: String,
    pub links: Vec<String>,
    pub ssr_data: Option<Value>,
    pub api_responses: Vec<Value>,
    pub error: Option<String>,
}

impl ScrapeResult {
    fn failed(url: &str, tier: ScrapeTier, error: String) -> Self {
        Self {
            url: url.to_string(),
            tier,
            status_code: 0,
            title: None,
            description: None,
            html: String::new(),
            text: String::new(),
            markdown: String::new(),
            links: Vec::new(),
            ssr_data: None,
            api_responses: Vec::new(),
            error: Some(error),
        }
    }
}

/// One tier implementation. The cascade consults these in order.
#[async_trait]
pub(crate) trait TierFetch: Send + Sync {
    fn tier(&self) -> ScrapeTier;
    async fn fetch(&self, url: &str, opts: &ScrapeOptions) -> Result<ScrapeResult, AgentError>;
}

/// Parse once, share the DOM between SSR detection and extraction. The
/// sufficiency check runs on the raw text, so its destructive stripping
/// never touches the parsed document.
fn build_page_result(
    url: &str,
    tier: ScrapeTier,
    status_code: u16,
    html: &str,
    fallback_title: Option<String>,
    main_only: bool,
) -> Result<ScrapeResult, AgentError> {
    if !extract::has_enough_content(html) {
        return Err(AgentError::Scrape(
            "page has no usable content (empty shell or challenge page)".into(),
        ));
    }
    let base = Url::parse(url).map_err(|e| AgentError::Scrape(format!("bad url: {}", e)))?;
    let doc = Html::parse_document(html);
    let ssr_data = ssr::detect_in_document(&doc, html).map(|s| s.data);
    let ExtractedContent {
        html: content_html,
        text,
        markdown,
        title,
        description,
        links,
    } = extract::extract_from_document(&doc, main_only, &base);

    Ok(ScrapeResult {
        url: url.to_string(),
        tier,
        status_code,
        title: title.or(fallback_title),
        description,
        html: content_html,
        text,
        markdown,
        links,
        ssr_data,
        api_responses: Vec::new(),
        error: None,
    })
}

fn classify_status(status: u16) -> Result<(), AgentError> {
    match status {
        403 | 429 | 503 => Err(AgentError::Scrape(format!("anti-bot status {}", status))),
        s if s >= 400 => Err(AgentError::Scrape(format!("http status {}", s))),
        _ => Ok(()),
    }
}

fn require_text_content_type(content_type: &str) -> Result<(), AgentError> {
    let lower = content_type.to_lowercase();
    if lower.contains("text/html") || lower.contains("text/plain") {
        Ok(())
    } else {
        Err(AgentError::Scrape(format!(
            "unsupported content-type {}",
            content_type
        )))
    }
}

// ---- tier 1: plain HTTP ----

pub(crate) struct PlainHttpTier {
    client: reqwest::Client,
}

impl PlainHttpTier {
    fn new() -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(DESKTOP_USER_AGENT)
            .build()
            .map_err(|e| AgentError::Scrape(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<(u16, String, String), AgentError> {
        let resp = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7")
            .header("Cache-Control", "no-cache")
            .header("Pragma", "no-cache")
            .send()
            .await
            .map_err(|e| AgentError::Scrape(format!("request failed: {}", e)))?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| AgentError::Scrape(format!("body read failed: {}", e)))?;
        Ok((status, content_type, body))
    }
}

#[async_trait]
impl TierFetch for PlainHttpTier {
    fn tier(&self) -> ScrapeTier {
        ScrapeTier::Http
    }

    async fn fetch(&self, url: &str, opts: &ScrapeOptions) -> Result<ScrapeResult, AgentError> {
        let (status, content_type, body) = self.get(url).await?;
        classify_status(status)?;
        require_text_content_type(&content_type)?;
        build_page_result(url, ScrapeTier::Http, status, &body, None, opts.main_only)
    }
}

/// Static-path fetcher for the agent: the plain-HTTP tier without the
/// status/content-type policy (the static loop applies its own checks).
pub struct PlainHttpFetcher {
    inner: PlainHttpTier,
}

impl PlainHttpFetcher {
    pub fn new() -> Result<Self, AgentError> {
        Ok(Self {
            inner: PlainHttpTier::new()?,
        })
    }
}

#[async_trait]
impl StaticFetch for PlainHttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AgentError> {
        let (status, content_type, body) = self.inner.get(url).await?;
        Ok(FetchedPage {
            status,
            content_type,
            body,
        })
    }
}

// ---- tier 2: stealth HTTP ----

pub(crate) struct StealthHttpTier {
    client: reqwest::Client,
}

impl StealthHttpTier {
    fn new() -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(STEALTH_TIMEOUT_MS))
            .user_agent(DESKTOP_USER_AGENT)
            .build()
            .map_err(|e| AgentError::Scrape(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TierFetch for StealthHttpTier {
    fn tier(&self) -> ScrapeTier {
        ScrapeTier::Stealth
    }

    async fn fetch(&self, url: &str, opts: &ScrapeOptions) -> Result<ScrapeResult, AgentError> {
        let mut last_err = None;
        for attempt in 0..=STEALTH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            let sent = self
                .client
                .get(url)
                .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8")
                .header("Accept-Language", "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7")
                .header("Cache-Control", "no-cache")
                .header("Pragma", "no-cache")
                .header("Sec-Fetch-Dest", "document")
                .header("Sec-Fetch-Mode", "navigate")
                .header("Sec-Fetch-Site", "none")
                .header("Sec-Fetch-User", "?1")
                .header("Upgrade-Insecure-Requests", "1")
                .header("Sec-Ch-Ua", "\"Chromium\";v=\"125\", \"Not.A/Brand\";v=\"24\"")
                .header("Sec-Ch-Ua-Mobile", "?0")
                .header("Sec-Ch-Ua-Platform", "\"Windows\"")
                .send()
                .await;
            let resp = match sent {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(AgentError::Scrape(format!("request failed: {}", e)));
                    continue;
                }
            };
            let status = resp.status().as_u16();
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = match resp.text().await {
                Ok(b) => b,
                Err(e) => {
                    last_err = Some(AgentError::Scrape(format!("body read failed: {}", e)));
                    continue;
                }
            };
            classify_status(status)?;
            require_text_content_type(&content_type)?;
            return build_page_result(url, ScrapeTier::Stealth, status, &body, None, opts.main_only);
        }
        Err(last_err.unwrap_or_else(|| AgentError::Scrape("request failed".into())))
    }
}

// ---- tier 3: headless browser ----

const HUMAN_SCROLL_JS: &str = r#"
new Promise((resolve) => {
  const total = document.body ? document.body.scrollHeight : 0;
  const step = Math.max(300, Math.floor(total / 6));
  let travelled = 0;
  const tick = () => {
    if (travelled >= total) {
      window.scrollTo(0, 0);
      resolve(true);
      return;
    }
    window.scrollBy(0, step);
    travelled += step;
    setTimeout(tick, 120 + Math.random() * 130);
  };
  tick();
})
"#;

pub(crate) struct BrowserTier {
    launcher: Arc<dyn BrowserLauncher>,
    browser: tokio::sync::Mutex<Option<Arc<dyn BrowserHandle>>>,
}

impl BrowserTier {
    pub(crate) fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            browser: tokio::sync::Mutex::new(None),
        }
    }

    /// Launch once, reuse while connected.
    async fn browser(&self) -> Result<Arc<dyn BrowserHandle>, AgentError> {
        let mut guard = self.browser.lock().await;
        if let Some(b) = guard.as_ref() {
            if b.is_connected() {
                return Ok(b.clone());
            }
            *guard = None;
        }
        let launched = self.launcher.launch().await?;
        *guard = Some(launched.clone());
        Ok(launched)
    }

    fn page_options(&self, opts: &ScrapeOptions) -> PageOptions {
        let mut blocked: Vec<String> = BLOCKED_RESOURCE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        blocked.extend(TRACKER_BLOCKLIST.iter().map(|host| format!("*{}*", host)));
        PageOptions {
            user_agent: Some(DESKTOP_USER_AGENT.to_string()),
            viewport: Some((1920, 1080)),
            locale: Some("pt-BR".to_string()),
            timezone: Some("America/Sao_Paulo".to_string()),
            init_script: Some(STEALTH_INIT_SCRIPT.to_string()),
            blocked_url_patterns: blocked,
            cookies: opts.cookies.clone(),
            extra_headers: Default::default(),
            auto_dismiss_dialogs: true,
            capture_json_responses: opts.capture_api_responses,
        }
    }
}

#[async_trait]
impl TierFetch for BrowserTier {
    fn tier(&self) -> ScrapeTier {
        ScrapeTier::Browser
    }

    async fn fetch(&self, url: &str, opts: &ScrapeOptions) -> Result<ScrapeResult, AgentError> {
        let browser = self.browser().await?;
        let page = browser.new_page(&self.page_options(opts)).await?;

        let outcome = async {
            if let Err(first) = page.goto(url, opts.timeout_ms).await {
                debug!(error = %first, "navigation failed, retrying once");
                tokio::time::sleep(Duration::from_millis(NAV_RETRY_DELAY_MS)).await;
                page.goto(url, opts.timeout_ms).await?;
            }

            let idle_budget = NETWORK_IDLE_CAP_MS.min(opts.timeout_ms / 2);
            let _ = page.wait_for_load(LoadState::NetworkIdle, idle_budget).await;

            if let Some(selector) = &opts.wait_for_selector {
                let _ = page
                    .wait_for_selector(selector, WAIT_SELECTOR_TIMEOUT_MS)
                    .await;
            }

            let _ = page.evaluate(HUMAN_SCROLL_JS).await;

            let html = page.content().await?;
            let title = page.title().await.ok().filter(|t| !t.trim().is_empty());
            let api_responses = if opts.capture_api_responses {
                page.json_responses().await
            } else {
                Vec::new()
            };
            let mut result =
                build_page_result(url, ScrapeTier::Browser, 200, &html, title, opts.main_only)?;
            result.api_responses = api_responses;
            Ok(result)
        }
        .await;

        page.close().await;
        outcome
    }
}

// ---- the cascade ----

pub struct Scraper {
    resolver: Arc<dyn Resolve>,
    tiers: Vec<Arc<dyn TierFetch>>,
}

impl Scraper {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Result<Self, AgentError> {
        Ok(Self {
            resolver: Arc::new(SystemResolver),
            tiers: vec![
                Arc::new(PlainHttpTier::new()?),
                Arc::new(StealthHttpTier::new()?),
                Arc::new(BrowserTier::new(launcher)),
            ],
        })
    }

    pub(crate) fn with_tiers(resolver: Arc<dyn Resolve>, tiers: Vec<Arc<dyn TierFetch>>) -> Self {
        Self { resolver, tiers }
    }

    /// A thin result with no SSR payload is treated as a miss.
    fn needs_escalation(result: &ScrapeResult) -> bool {
        result.markdown.chars().count() < MIN_MARKDOWN_CHARS && result.ssr_data.is_none()
    }

    /// Scrape one URL through the cascade. Never returns an error: every
    /// failure mode lands in `ScrapeResult.error`.
    pub async fn scrape(&self, url: &str, opts: &ScrapeOptions) -> ScrapeResult {
        let canonical = match safety::validate_url_with(
            self.resolver.as_ref(),
            url,
            &opts.allowed_domains,
            &opts.blocked_domains,
        )
        .await
        {
            Ok(u) => u,
            Err(e) => return ScrapeResult::failed(url, ScrapeTier::Http, e.to_string()),
        };

        if let Some(forced) = opts.force_tier {
            let tier = match self.tiers.iter().find(|t| t.tier() == forced) {
                Some(t) => t,
                None => {
                    return ScrapeResult::failed(
                        &canonical,
                        forced,
                        format!("tier {} not available", forced.as_str()),
                    )
                }
            };
            return match tier.fetch(&canonical, opts).await {
                Ok(result) => result,
                Err(e) => ScrapeResult::failed(&canonical, forced, e.to_string()),
            };
        }

        let mut reasons: Vec<String> = Vec::new();
        let last = self.tiers.len().saturating_sub(1);
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.fetch(&canonical, opts).await {
                Ok(result) => {
                    if idx < last && Self::needs_escalation(&result) {
                        reasons.push(format!(
                            "{}: thin content ({} markdown chars, no ssr data)",
                            tier.tier().as_str(),
                            result.markdown.chars().count()
                        ));
                        info!(tier = tier.tier().as_str(), "escalating: thin content");
                        continue;
                    }
                    return result;
                }
                Err(e) => {
                    reasons.push(format!("{}: {}", tier.tier().as_str(), e));
                    if idx < last {
                        info!(tier = tier.tier().as_str(), error = %e, "escalating after tier failure");
                    } else {
                        warn!(error = %e, "all scrape tiers failed");
                    }
                }
            }
        }

        let summary = reasons
            .iter()
            .map(|r| format!("- {}", r))
            .collect::<Vec<_>>()
            .join("\n");
        ScrapeResult::failed(
            &canonical,
            ScrapeTier::Browser,
            format!("all tiers failed:\n{}", summary),
        )
    }

    /// Scrape a batch with bounded concurrency: each batch completes before
    /// the next starts, and one URL's failure never aborts the rest.
    pub async fn scrape_many(
        &self,
        urls: &[String],
        concurrency: usize,
        opts: &ScrapeOptions,
    ) -> Vec<ScrapeResult> {
        let concurrency = concurrency.max(1);
        let mut results = Vec::with_capacity(urls.len());
        for batch in urls.chunks(concurrency) {
            let futures = batch.iter().map(|url| self.scrape(url, opts));
            results.extend(futures::future::join_all(futures).await);
        }
        results
    }
}

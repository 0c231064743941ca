//! Chromium implementation of the browser contract over the DevTools
//! protocol. Element operations run as in-page script against the resolved
//! locator; keyboard input goes through CDP input dispatch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chromiumoxide::browser::{Browser as OxideBrowser, BrowserConfig as OxideBrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::network as cdp_network;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, Headers, SetBlockedUrLsParams, SetCookiesParams, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, EventJavascriptDialogOpening,
    HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::driver::{BrowserHandle, BrowserLauncher, LoadState, Locator, PageDriver, PageOptions};
use crate::error::AgentError;
use crate::stealth::STEALTH_LAUNCH_ARGS;

const ELEMENT_POLL_MS: u64 = 100;
const MAX_CAPTURED_BODY_BYTES: usize = 500_000;

fn browser_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Browser(e.to_string())
}

fn exec_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Execution(e.to_string())
}

/// Launches Chromium with the anti-automation flag set.
pub struct CdpLauncher {
    proxy: Option<ProxyConfig>,
    headless: bool,
}

impl CdpLauncher {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self {
            proxy,
            headless: true,
        }
    }

    pub fn with_head(mut self) -> Self {
        self.headless = false;
        self
    }
}

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, AgentError> {
        let mut builder = OxideBrowserConfig::builder();
        if !self.headless {
            builder = builder.with_head();
        }
        for arg in STEALTH_LAUNCH_ARGS {
            builder = builder.arg(*arg);
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.server));
        }
        // Unique profile per launch avoids ProcessSingleton lock clashes
        // when several browsers start in quick succession.
        let mut profile = std::env::temp_dir();
        profile.push(format!(
            "auspex-profile-{}-{}",
            std::process::id(),
            nanoid::nanoid!(8)
        ));
        let _ = std::fs::create_dir_all(&profile);
        builder = builder.user_data_dir(profile);

        let cfg = builder.build().map_err(AgentError::Browser)?;
        let (browser, mut handler) = OxideBrowser::launch(cfg).await.map_err(browser_err)?;

        let (connected_tx, connected_rx) = watch::channel(true);
        let tx = connected_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            let _ = tx.send(false);
        });

        Ok(Arc::new(CdpBrowser {
            browser: tokio::sync::Mutex::new(browser),
            connected_tx,
            connected_rx,
        }))
    }
}

pub struct CdpBrowser {
    browser: tokio::sync::Mutex<OxideBrowser>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for CdpBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpBrowser").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    async fn new_page(&self, opts: &PageOptions) -> Result<Box<dyn PageDriver>, AgentError> {
        let page = {
            let browser = self.browser.lock().await;
            browser.new_page("about:blank").await.map_err(browser_err)?
        };
        let driver = CdpPage::configure(page, opts).await?;
        Ok(Box::new(driver))
    }

    async fn wait_disconnected(&self) {
        let mut rx = self.connected_rx.clone();
        let _ = rx.wait_for(|connected| !connected).await;
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!(error = %e, "browser close");
        }
        let _ = self.connected_tx.send(false);
    }
}

pub struct CdpPage {
    page: Page,
    captured: Arc<Mutex<Vec<Value>>>,
}

impl CdpPage {
    async fn configure(page: Page, opts: &PageOptions) -> Result<Self, AgentError> {
        if let Some((width, height)) = opts.viewport {
            let metrics = SetDeviceMetricsOverrideParams::builder()
                .width(i64::from(width))
                .height(i64::from(height))
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(AgentError::Browser)?;
            page.execute(metrics).await.map_err(browser_err)?;
        }

        if let Some(ua) = &opts.user_agent {
            page.set_user_agent(ua.clone()).await.map_err(browser_err)?;
        }
        if let Some(locale) = &opts.locale {
            let _ = page
                .execute(SetLocaleOverrideParams {
                    locale: Some(locale.clone()),
                })
                .await;
        }
        if let Some(tz) = &opts.timezone {
            let _ = page
                .execute(SetTimezoneOverrideParams {
                    timezone_id: tz.clone(),
                })
                .await;
        }

        if let Some(script) = &opts.init_script {
            let params = AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(script.clone())
                .build()
                .map_err(AgentError::Browser)?;
            page.execute(params).await.map_err(browser_err)?;
        }

        if !opts.blocked_url_patterns.is_empty() {
            let _ = page
                .execute(SetBlockedUrLsParams {
                    urls: opts.blocked_url_patterns.clone(),
                })
                .await;
        }

        if !opts.extra_headers.is_empty() {
            let _ = page
                .execute(SetExtraHttpHeadersParams {
                    headers: Headers::new(json!(opts.extra_headers)),
                })
                .await;
        }

        if !opts.cookies.is_empty() {
            let mut cookies = Vec::new();
            for cookie in &opts.cookies {
                let param = CookieParam::builder()
                    .name(cookie.name.clone())
                    .value(cookie.value.clone())
                    .domain(cookie.domain.clone())
                    .path(cookie.path.clone())
                    .build()
                    .map_err(AgentError::Browser)?;
                cookies.push(param);
            }
            let _ = page.execute(SetCookiesParams { cookies }).await;
        }

        if opts.auto_dismiss_dialogs {
            let dialog_page = page.clone();
            let mut dialogs = page
                .event_listener::<EventJavascriptDialogOpening>()
                .await
                .map_err(browser_err)?;
            tokio::spawn(async move {
                while let Some(_dialog) = dialogs.next().await {
                    if let Ok(params) = HandleJavaScriptDialogParams::builder()
                        .accept(true)
                        .build()
                    {
                        let _ = dialog_page.execute(params).await;
                    }
                }
            });
        }

        let captured = Arc::new(Mutex::new(Vec::new()));
        if opts.capture_json_responses {
            let _ = page.execute(cdp_network::EnableParams::default()).await;
            let store = captured.clone();
            let body_page = page.clone();
            let mut responses = page
                .event_listener::<cdp_network::EventResponseReceived>()
                .await
                .map_err(browser_err)?;
            tokio::spawn(async move {
                while let Some(event) = responses.next().await {
                    let mime = event.response.mime_type.to_lowercase();
                    if !mime.contains("application/json") || is_asset_url(&event.response.url) {
                        continue;
                    }
                    let params = cdp_network::GetResponseBodyParams {
                        request_id: event.request_id.clone(),
                    };
                    if let Ok(resp) = body_page.execute(params).await {
                        let body = &resp.result.body;
                        if body.len() <= MAX_CAPTURED_BODY_BYTES {
                            if let Ok(value) = serde_json::from_str::<Value>(body) {
                                if let Ok(mut guard) = store.lock() {
                                    guard.push(value);
                                }
                            }
                        }
                    }
                }
            });
        }

        Ok(Self { page, captured })
    }

    async fn eval_value(&self, js: &str) -> Result<Value, AgentError> {
        let params = EvaluateParams::builder()
            .expression(js)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(AgentError::Browser)?;
        let resp = self.page.execute(params).await.map_err(exec_err)?;
        if let Some(details) = &resp.result.exception_details {
            return Err(AgentError::Execution(format!(
                "script threw: {}",
                details.text
            )));
        }
        Ok(resp.result.result.value.clone().unwrap_or(Value::Null))
    }

    /// Run a locator-resolved element action, polling until the element
    /// appears or the budget runs out.
    async fn element_op(
        &self,
        locator: &Locator,
        action_js: &str,
        timeout_ms: u64,
    ) -> Result<(), AgentError> {
        let script = element_script(locator, action_js)?;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.eval_value(&script).await {
                Ok(Value::Bool(true)) => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "element op attempt failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Execution(format!(
                    "element not found for {:?} within {} ms",
                    locator, timeout_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(ELEMENT_POLL_MS)).await;
        }
    }

    async fn dispatch_key(&self, kind: DispatchKeyEventType, key: &str) -> Result<(), AgentError> {
        let mut builder = DispatchKeyEventParams::builder().r#type(kind).key(key);
        if key == "Enter" {
            builder = builder.text("\r");
        }
        if key == "Space" {
            builder = builder.key(" ").text(" ");
        }
        let params = builder.build().map_err(AgentError::Browser)?;
        self.page.execute(params).await.map_err(exec_err)?;
        Ok(())
    }
}

fn is_asset_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    let path = lower.split(&['?', '#'][..]).next().unwrap_or("");
    [".js", ".css", ".png", ".jpg", ".jpeg", ".svg", ".woff", ".woff2", ".map"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

/// In-page locator resolution shared by every element operation. The
/// locator is embedded as JSON, so selector text never breaks the script.
fn element_script(locator: &Locator, action_js: &str) -> Result<String, AgentError> {
    let loc_json = match locator {
        Locator::Css(css) => json!({ "css": css }),
        Locator::Role { role, name } => json!({ "role": role, "name": name }),
    };
    let loc_literal = serde_json::to_string(&loc_json)
        .map_err(|e| AgentError::Execution(format!("locator encode: {}", e)))?;
    Ok(format!(
        r#"(() => {{
  const loc = {loc};
  const byRole = (role, name) => {{
    const implicit = {{
      button: ['button', 'input[type="button"]', 'input[type="submit"]'],
      link: ['a[href]'],
      textbox: ['input:not([type])', 'input[type="text"]', 'input[type="search"]', 'input[type="email"]', 'input[type="password"]', 'textarea'],
      checkbox: ['input[type="checkbox"]'],
      radio: ['input[type="radio"]'],
      combobox: ['select'],
      heading: ['h1', 'h2', 'h3', 'h4', 'h5', 'h6'],
    }};
    const selectors = ['[role="' + role + '"]'].concat(implicit[role] || []);
    const candidates = [];
    for (const s of selectors) candidates.push(...document.querySelectorAll(s));
    if (name == null) return candidates[0] || null;
    const accName = (el) =>
      (el.getAttribute('aria-label') || el.innerText || el.value || el.title || '').trim();
    return (
      candidates.find((el) => accName(el) === name) ||
      candidates.find((el) => accName(el).includes(name)) ||
      null
    );
  }};
  const el = loc.css ? document.querySelector(loc.css) : byRole(loc.role, loc.name ?? null);
  if (!el) return false;
  {action}
  return true;
}})()"#,
        loc = loc_literal,
        action = action_js
    ))
}

const READY_STATE_JS: &str = "document.readyState";

#[async_trait]
impl PageDriver for CdpPage {
    async fn goto(&self, url: &str, timeout_ms: u64) -> Result<(), AgentError> {
        let navigate = async {
            self.page.goto(url).await?;
            let _ = self.page.wait_for_navigation().await;
            Ok::<(), chromiumoxide::error::CdpError>(())
        };
        match tokio::time::timeout(Duration::from_millis(timeout_ms), navigate).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AgentError::Execution(format!("navigation failed: {}", e))),
            Err(_) => Err(AgentError::Execution(format!(
                "navigation timed out after {} ms",
                timeout_ms
            ))),
        }
    }

    async fn current_url(&self) -> String {
        match self.page.url().await {
            Ok(Some(url)) => url,
            _ => String::new(),
        }
    }

    async fn title(&self) -> Result<String, AgentError> {
        match self.eval_value("document.title").await? {
            Value::String(s) => Ok(s),
            _ => Ok(String::new()),
        }
    }

    async fn content(&self) -> Result<String, AgentError> {
        self.page.content().await.map_err(browser_err)
    }

    async fn evaluate(&self, js: &str) -> Result<Value, AgentError> {
        self.eval_value(js).await
    }

    async fn click(&self, locator: &Locator, timeout_ms: u64) -> Result<(), AgentError> {
        self.element_op(
            locator,
            "el.scrollIntoView({block: 'center'}); el.click();",
            timeout_ms,
        )
        .await
    }

    async fn fill(
        &self,
        locator: &Locator,
        text: &str,
        timeout_ms: u64,
    ) -> Result<(), AgentError> {
        let text_literal = serde_json::to_string(text)
            .map_err(|e| AgentError::Execution(format!("text encode: {}", e)))?;
        let action = format!(
            r#"const v = {text};
  el.focus();
  const proto = el.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  const desc = Object.getOwnPropertyDescriptor(proto, 'value');
  if (desc && desc.set) {{ desc.set.call(el, v); }} else {{ el.value = v; }}
  el.dispatchEvent(new Event('input', {{bubbles: true}}));
  el.dispatchEvent(new Event('change', {{bubbles: true}}));"#,
            text = text_literal
        );
        self.element_op(locator, &action, timeout_ms).await
    }

    async fn select_value(
        &self,
        locator: &Locator,
        value: &str,
        timeout_ms: u64,
    ) -> Result<(), AgentError> {
        let value_literal = serde_json::to_string(value)
            .map_err(|e| AgentError::Execution(format!("value encode: {}", e)))?;
        let action = format!(
            r#"el.value = {value};
  el.dispatchEvent(new Event('input', {{bubbles: true}}));
  el.dispatchEvent(new Event('change', {{bubbles: true}}));"#,
            value = value_literal
        );
        self.element_op(locator, &action, timeout_ms).await
    }

    async fn hover(&self, locator: &Locator, timeout_ms: u64) -> Result<(), AgentError> {
        self.element_op(
            locator,
            r#"el.scrollIntoView({block: 'center'});
  for (const type of ['pointerover', 'mouseover', 'mouseenter']) {
    el.dispatchEvent(new MouseEvent(type, {bubbles: true}));
  }"#,
            timeout_ms,
        )
        .await
    }

    async fn press_key(&self, key: &str) -> Result<(), AgentError> {
        self.dispatch_key(DispatchKeyEventType::KeyDown, key).await?;
        self.dispatch_key(DispatchKeyEventType::KeyUp, key).await
    }

    async fn wait_for_load(&self, state: LoadState, timeout_ms: u64) -> Result<(), AgentError> {
        let wanted: &[&str] = match state {
            LoadState::DomContentLoaded => &["interactive", "complete"],
            LoadState::NetworkIdle => &["complete"],
        };
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Ok(Value::String(ready)) = self.eval_value(READY_STATE_JS).await {
                if wanted.contains(&ready.as_str()) {
                    // readyState has no network-idle notion; give in-flight
                    // requests a short settle window instead.
                    if state == LoadState::NetworkIdle {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                    }
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Execution(format!(
                    "load state {:?} not reached within {} ms",
                    state, timeout_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(ELEMENT_POLL_MS)).await;
        }
    }

    async fn wait_for_selector(&self, css: &str, timeout_ms: u64) -> Result<(), AgentError> {
        let css_literal = serde_json::to_string(css)
            .map_err(|e| AgentError::Execution(format!("selector encode: {}", e)))?;
        let script = format!("document.querySelector({}) !== null", css_literal);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Ok(Value::Bool(true)) = self.eval_value(&script).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Execution(format!(
                    "selector {} not found within {} ms",
                    css, timeout_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(ELEMENT_POLL_MS)).await;
        }
    }

    async fn screenshot_jpeg(&self, quality: u8) -> Result<String, AgentError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(i64::from(quality))
            .full_page(false)
            .build();
        let bytes = self.page.screenshot(params).await.map_err(browser_err)?;
        Ok(B64.encode(bytes))
    }

    async fn ax_tree(&self) -> Result<String, AgentError> {
        match self.eval_value(AX_TREE_JS).await? {
            Value::String(tree) => Ok(tree),
            _ => Ok(String::new()),
        }
    }

    async fn json_responses(&self) -> Vec<Value> {
        self.captured
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            warn!(error = %e, "page close");
        }
    }
}

/// Rough accessibility outline rendered as indented YAML list items, rooted
/// at body. Depth and size are bounded in the walker itself.
const AX_TREE_JS: &str = r#"
(() => {
  const lines = [];
  const implicitRole = {
    A: 'link', BUTTON: 'button', INPUT: 'textbox', TEXTAREA: 'textbox',
    SELECT: 'combobox', H1: 'heading', H2: 'heading', H3: 'heading',
    NAV: 'navigation', MAIN: 'main', FORM: 'form', IMG: 'image',
  };
  const roleOf = (el) => el.getAttribute('role') || implicitRole[el.tagName] || null;
  const nameOf = (el) =>
    (el.getAttribute('aria-label') || (el.innerText || '').trim().slice(0, 60) ||
     el.getAttribute('title') || '');
  const walk = (el, depth) => {
    if (lines.length >= 400) return;
    const role = roleOf(el);
    if (role) {
      const name = nameOf(el).replace(/"/g, '\\"').replace(/\s+/g, ' ');
      lines.push('  '.repeat(depth) + '- ' + role + (name ? ': "' + name + '"' : ''));
    }
    for (const child of el.children) walk(child, role ? depth + 1 : depth);
  };
  if (document.body) walk(document.body, 0);
  return lines.join('\n');
})()
"#;

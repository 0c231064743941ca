//! Named contract for the headless browser. The engine only ever talks to
//! these traits; `cdp` provides the production implementation and tests
//! substitute scripted doubles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::config::Cookie;
use crate::error::AgentError;

/// Element locator: plain CSS, or an accessibility `role=<role>[name="…"]`
/// pair. The `name` may carry escaped `\"` quotes, which are unescaped here;
/// other escape sequences pass through verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum Locator {
    Css(String),
    Role { role: String, name: Option<String> },
}

fn role_capture_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^role=(\w+)(?:\[name="(.*)"\])?$"#).unwrap())
}

impl Locator {
    pub fn parse(selector: &str) -> Locator {
        if let Some(caps) = role_capture_re().captures(selector) {
            let role = caps[1].to_string();
            let name = caps.get(2).map(|m| m.as_str().replace("\\\"", "\""));
            return Locator::Role { role, name };
        }
        Locator::Css(selector.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    NetworkIdle,
}

/// Per-context options applied when a page is created, before navigation.
#[derive(Clone, Debug, Default)]
pub struct PageOptions {
    pub user_agent: Option<String>,
    pub viewport: Option<(u32, u32)>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    /// Script guaranteed to run before any page script.
    pub init_script: Option<String>,
    pub blocked_url_patterns: Vec<String>,
    pub cookies: Vec<Cookie>,
    pub extra_headers: HashMap<String, String>,
    pub auto_dismiss_dialogs: bool,
    /// Record intercepted JSON API responses (bounded; see the scraper tier).
    pub capture_json_responses: bool,
}

/// One live page. All waits take explicit millisecond budgets.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str, timeout_ms: u64) -> Result<(), AgentError>;
    async fn current_url(&self) -> String;
    async fn title(&self) -> Result<String, AgentError>;
    async fn content(&self) -> Result<String, AgentError>;
    /// Evaluate a JS expression, awaiting promises, returning its JSON value.
    async fn evaluate(&self, js: &str) -> Result<Value, AgentError>;
    async fn click(&self, locator: &Locator, timeout_ms: u64) -> Result<(), AgentError>;
    async fn fill(&self, locator: &Locator, text: &str, timeout_ms: u64)
        -> Result<(), AgentError>;
    async fn select_value(
        &self,
        locator: &Locator,
        value: &str,
        timeout_ms: u64,
    ) -> Result<(), AgentError>;
    async fn hover(&self, locator: &Locator, timeout_ms: u64) -> Result<(), AgentError>;
    async fn press_key(&self, key: &str) -> Result<(), AgentError>;
    async fn wait_for_load(&self, state: LoadState, timeout_ms: u64) -> Result<(), AgentError>;
    async fn wait_for_selector(&self, css: &str, timeout_ms: u64) -> Result<(), AgentError>;
    /// Base64 JPEG at the given quality.
    async fn screenshot_jpeg(&self, quality: u8) -> Result<String, AgentError>;
    /// Accessibility tree rooted at body, rendered as indented YAML lines.
    async fn ax_tree(&self) -> Result<String, AgentError>;
    /// JSON responses captured so far (empty unless capture was requested).
    async fn json_responses(&self) -> Vec<Value>;
    async fn close(&self);
}

/// One live browser process.
#[async_trait]
pub trait BrowserHandle: Send + Sync + std::fmt::Debug {
    fn is_connected(&self) -> bool;
    async fn new_page(&self, opts: &PageOptions) -> Result<Box<dyn PageDriver>, AgentError>;
    /// Resolves when the underlying process disconnects.
    async fn wait_disconnected(&self);
    async fn close(&self);
}

/// Launches browsers on demand (the pool's factory seam).
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, AgentError>;
}

/// Inert page driver, useful as a placeholder in wiring code and tests.
#[derive(Clone, Copy, Default)]
pub struct NoopPage;

#[async_trait]
impl PageDriver for NoopPage {
    async fn goto(&self, _url: &str, _timeout_ms: u64) -> Result<(), AgentError> {
        Ok(())
    }
    async fn current_url(&self) -> String {
        "about:blank".to_string()
    }
    async fn title(&self) -> Result<String, AgentError> {
        Ok("noop".to_string())
    }
    async fn content(&self) -> Result<String, AgentError> {
        Ok("<html></html>".to_string())
    }
    async fn evaluate(&self, _js: &str) -> Result<Value, AgentError> {
        Ok(Value::Null)
    }
    async fn click(&self, _locator: &Locator, _timeout_ms: u64) -> Result<(), AgentError> {
        Ok(())
    }
    async fn fill(
        &self,
        _locator: &Locator,
        _text: &str,
        _timeout_ms: u64,
    ) -> Result<(), AgentError> {
        Ok(())
    }
    async fn select_value(
        &self,
        _locator: &Locator,
        _value: &str,
        _timeout_ms: u64,
    ) -> Result<(), AgentError> {
        Ok(())
    }
    async fn hover(&self, _locator: &Locator, _timeout_ms: u64) -> Result<(), AgentError> {
        Ok(())
    }
    async fn press_key(&self, _key: &str) -> Result<(), AgentError> {
        Ok(())
    }
    async fn wait_for_load(&self, _state: LoadState, _timeout_ms: u64) -> Result<(), AgentError> {
        Ok(())
    }
    async fn wait_for_selector(&self, _css: &str, _timeout_ms: u64) -> Result<(), AgentError> {
        Ok(())
    }
    async fn screenshot_jpeg(&self, _quality: u8) -> Result<String, AgentError> {
        Err(AgentError::Browser("noop page has no screen".into()))
    }
    async fn ax_tree(&self) -> Result<String, AgentError> {
        Ok(String::new())
    }
    async fn json_responses(&self) -> Vec<Value> {
        Vec::new()
    }
    async fn close(&self) {}
}

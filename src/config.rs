use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

pub const DEFAULT_MAX_ITERATIONS: u32 = 30;
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_WAIT_MS: u64 = 5_000;
pub const DEFAULT_NAVIGATION_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_ACTION_DELAY_MS: u64 = 500;
pub const DEFAULT_SCREENSHOT_QUALITY: u8 = 75;
pub const DEFAULT_BLOCKED_TEXT_THRESHOLD: usize = 2_000;

/// Upstream proxy for the browser tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Cookie seeded into the browser context before navigation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// Immutable agent configuration. Built once, validated up front.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_completion_tokens: u32,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub max_iterations: u32,
    pub timeout_ms: u64,
    pub max_wait_ms: u64,
    pub navigation_timeout_ms: u64,
    pub action_delay_ms: u64,
    /// 0 = unlimited.
    pub max_total_tokens: u64,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub proxy: Option<ProxyConfig>,
    pub cookies: Vec<Cookie>,
    pub extra_headers: HashMap<String, String>,
    pub vision: bool,
    /// JPEG quality 1..=100.
    pub screenshot_quality: u8,
    /// Pages whose visible text is shorter than this are candidates for the
    /// blocked-page heuristic.
    pub blocked_text_threshold: usize,
    /// Directory for per-run plain-text logs; None disables the log file.
    pub log_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_completion_tokens: 1_024,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            navigation_timeout_ms: DEFAULT_NAVIGATION_TIMEOUT_MS,
            action_delay_ms: DEFAULT_ACTION_DELAY_MS,
            max_total_tokens: 0,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            proxy: None,
            cookies: Vec::new(),
            extra_headers: HashMap::new(),
            vision: false,
            screenshot_quality: DEFAULT_SCREENSHOT_QUALITY,
            blocked_text_threshold: DEFAULT_BLOCKED_TEXT_THRESHOLD,
            log_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.api_key.trim().is_empty() {
            return Err(AgentError::Config("api_key must not be empty".into()));
        }
        if self.base_url.trim().is_empty() {
            return Err(AgentError::Config("base_url must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(AgentError::Config("model must not be empty".into()));
        }
        if self.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be >= 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(AgentError::Config("timeout_ms must be >= 1".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AgentError::Config(format!(
                "temperature {} out of range 0..=2",
                self.temperature
            )));
        }
        if self.screenshot_quality == 0 || self.screenshot_quality > 100 {
            return Err(AgentError::Config(format!(
                "screenshot_quality {} out of range 1..=100",
                self.screenshot_quality
            )));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag, polled at the top of each iteration and
/// before the first static-loop LLM call.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Opaque output-schema hint: a description injected into the prompt and a
/// validator applied to the final `done` payload.
pub struct OutputSchema {
    pub description: String,
    pub validator: Box<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>,
}

impl std::fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSchema")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Per-run inputs and overrides.
#[derive(Default)]
pub struct RunOptions {
    pub url: String,
    pub prompt: String,
    pub max_iterations: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub action_delay_ms: Option<u64>,
    pub vision: Option<bool>,
    pub cancel: Option<CancelFlag>,
    pub output_schema: Option<OutputSchema>,
}

impl RunOptions {
    pub fn new(url: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.url.trim().is_empty() {
            return Err(AgentError::Config("run url must not be empty".into()));
        }
        if self.prompt.trim().is_empty() {
            return Err(AgentError::Config("run prompt must not be empty".into()));
        }
        Ok(())
    }
}

//! The perception-decision-action engine: a one-shot static resolution
//! attempt, the iterative browser loop with its guards (cancellation,
//! deadline, token budget, blocked-page detection, loop detection, vision
//! escalation), and terminal result assembly.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::action::{self, AgentAction};
use crate::config::{AgentConfig, RunOptions};
use crate::driver::{BrowserHandle, BrowserLauncher, PageDriver, PageOptions};
use crate::error::AgentError;
use crate::exec;
use crate::extract;
use crate::llm::{is_vision_model, warn_non_vision_model, Decider, LlmClient, LlmUsage};
use crate::pool::BrowserPool;
use crate::prompt;
use crate::report::{render_report, RunLog};
use crate::safety::{self, Resolve, SystemResolver};
use crate::snapshot::{self, PageSnapshot};
use crate::stealth::STEALTH_INIT_SCRIPT;

/// Sliding window of recent action keys.
pub const RECENT_WINDOW: usize = 9;
/// The same key this many times within the window is a stuck loop.
pub const MAX_OCCURRENCES: usize = 3;
/// Consecutive failures before vision escalates (when available).
const VISION_FAILURE_THRESHOLD: u32 = 3;

const BLOCKED_URL_MARKERS: &[&str] =
    &["/sorry/", "/captcha", "/challenge", "/recaptcha", "/blocked"];

fn blocked_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)unusual traffic|not a robot|captcha|blocked your ip|access denied|rate limit",
        )
        .unwrap()
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Done,
    MaxIterations,
    Error,
    Timeout,
    Aborted,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Done => "done",
            AgentStatus::MaxIterations => "max_iterations",
            AgentStatus::Error => "error",
            AgentStatus::Timeout => "timeout",
            AgentStatus::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTier {
    Http,
    Browser,
}

impl RunTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTier::Http => "http",
            RunTier::Browser => "browser",
        }
    }
}

/// One dispatched action in the audit trail. Append-only per run.
#[derive(Clone, Debug, Serialize)]
pub struct ActionRecord {
    pub action: AgentAction,
    pub iteration: u32,
    pub at_epoch_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct MemoryStats {
    pub browser_peak_rss_kb: Option<u64>,
    pub process_heap_mb: Option<f64>,
}

/// Terminal outcome of one run. Immutable once returned.
#[derive(Debug, Serialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    pub tier: RunTier,
    pub data: Option<Value>,
    pub report: String,
    pub duration_ms: u64,
    pub actions: Vec<ActionRecord>,
    pub usage: LlmUsage,
    pub memory: MemoryStats,
    pub error: Option<String>,
}

/// Observer events fire on the loop's own thread of control, in iteration
/// order.
#[derive(Clone, Debug)]
pub enum RunEvent {
    Tier { tier: RunTier },
    Iteration { index: u32, url: String },
    Action { index: u32, action: AgentAction },
    Done { status: AgentStatus },
    Error { message: String },
}

pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Fetch seam for the static path (plain HTTP, no browser).
#[async_trait]
pub trait StaticFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AgentError>;
}

#[derive(Clone, Debug)]
pub struct FetchedPage {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn process_heap_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024.0);
        }
    }
    None
}

// ---- run state ----

struct RunState {
    prompt: String,
    url: String,
    start: Instant,
    max_iterations: u32,
    timeout_ms: u64,
    action_delay_ms: u64,
    vision_available: bool,
    vision_active: bool,
    usage: LlmUsage,
    history: Vec<String>,
    actions: Vec<ActionRecord>,
    recent: VecDeque<String>,
    consecutive_failures: u32,
    peak_rss_kb: Option<u64>,
    log: Option<RunLog>,
}

impl RunState {
    fn invalid_action(&mut self, iteration: u32, message: &str) {
        self.consecutive_failures += 1;
        self.history.push(format!(
            "[{}] INVALID ACTION: {}. Use shorter, simpler CSS selectors and return exactly one JSON action.",
            iteration, message
        ));
        self.maybe_escalate_vision(iteration);
    }

    fn maybe_escalate_vision(&mut self, iteration: u32) {
        if self.vision_available
            && !self.vision_active
            && self.consecutive_failures >= VISION_FAILURE_THRESHOLD
        {
            self.vision_active = true;
            self.history.push(format!(
                "[{}] Vision activated: screenshots will accompany the next decisions.",
                iteration
            ));
            info!(iteration, "vision escalated after repeated failures");
        }
    }

    fn record(&mut self, agent_action: &AgentAction, iteration: u32) {
        self.actions.push(ActionRecord {
            action: agent_action.clone(),
            iteration,
            at_epoch_ms: epoch_ms(),
        });
        if let Some(log) = &mut self.log {
            log.action(iteration, &agent_action.describe());
        }
    }

    fn push_recent(&mut self, key: String) {
        self.recent.push_back(key);
        if self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
    }

    fn is_stuck(&self, key: &str) -> bool {
        self.recent.iter().filter(|k| k.as_str() == key).count() >= MAX_OCCURRENCES
    }
}

fn is_blocked_page(snap: &PageSnapshot, text_threshold: usize) -> Option<String> {
    let url = snap.url.to_lowercase();
    for marker in BLOCKED_URL_MARKERS {
        if url.contains(marker) {
            return Some(format!("url matched challenge marker {}", marker));
        }
    }
    if snap.text.chars().count() < text_threshold {
        if let Some(m) = blocked_text_re().find(&snap.text) {
            return Some(format!("page text matched \"{}\"", m.as_str()));
        }
    }
    None
}

// ---- the agent ----

pub struct Agent {
    cfg: AgentConfig,
    decider: Arc<dyn Decider>,
    fetcher: Arc<dyn StaticFetch>,
    launcher: Arc<dyn BrowserLauncher>,
    pool: Option<Arc<BrowserPool>>,
    own_browser: tokio::sync::Mutex<Option<Arc<dyn BrowserHandle>>>,
    observer: Option<Arc<dyn RunObserver>>,
    rss_sampler: Option<Box<dyn Fn() -> Option<u64> + Send + Sync>>,
    resolver: Arc<dyn Resolve>,
}

impl Agent {
    /// Production wiring: LLM client, plain-HTTP fetcher, CDP launcher.
    pub fn new(cfg: AgentConfig) -> Result<Self, AgentError> {
        cfg.validate()?;
        let decider: Arc<dyn Decider> = Arc::new(LlmClient::new(cfg.clone())?);
        let fetcher: Arc<dyn StaticFetch> = Arc::new(crate::scrape::PlainHttpFetcher::new()?);
        let launcher: Arc<dyn BrowserLauncher> =
            Arc::new(crate::cdp::CdpLauncher::new(cfg.proxy.clone()));
        Self::with_parts(cfg, decider, fetcher, launcher)
    }

    /// Explicit wiring for embedders and tests.
    pub fn with_parts(
        cfg: AgentConfig,
        decider: Arc<dyn Decider>,
        fetcher: Arc<dyn StaticFetch>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, AgentError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            decider,
            fetcher,
            launcher,
            pool: None,
            own_browser: tokio::sync::Mutex::new(None),
            observer: None,
            rss_sampler: None,
            resolver: Arc::new(SystemResolver),
        })
    }

    /// Share a browser pool with other agents instead of owning a browser.
    pub fn with_pool(mut self, pool: Arc<BrowserPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Callback sampled once per iteration for peak browser RSS accounting.
    pub fn with_rss_sampler(
        mut self,
        sampler: Box<dyn Fn() -> Option<u64> + Send + Sync>,
    ) -> Self {
        self.rss_sampler = Some(sampler);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Close the agent-owned browser, if one was launched. Pooled browsers
    /// belong to their pool and are untouched.
    pub async fn shutdown(&self) {
        if let Some(browser) = self.own_browser.lock().await.take() {
            browser.close().await;
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }

    fn sample_rss(&self, state: &mut RunState) {
        if let Some(sampler) = &self.rss_sampler {
            if let Some(kb) = sampler() {
                state.peak_rss_kb = Some(state.peak_rss_kb.map_or(kb, |peak| peak.max(kb)));
            }
        }
    }

    /// Run one task to a terminal [`AgentResult`]. Only configuration, URL
    /// validation, and pool/browser acquisition failures escape as errors;
    /// everything else becomes a terminal result with status, report, and
    /// accounting.
    pub async fn run(&self, opts: RunOptions) -> Result<AgentResult, AgentError> {
        opts.validate()?;

        let start = Instant::now();
        let vision_wanted = opts.vision.unwrap_or(self.cfg.vision);
        let vision_available = vision_wanted && is_vision_model(&self.cfg.model);
        if vision_wanted && !vision_available {
            warn_non_vision_model(&self.cfg.model);
        }

        let url = safety::validate_url_with(
            self.resolver.as_ref(),
            &opts.url,
            &self.cfg.allowed_domains,
            &self.cfg.blocked_domains,
        )
        .await?;

        let mut state = RunState {
            prompt: opts.prompt.clone(),
            url: url.clone(),
            start,
            max_iterations: opts.max_iterations.unwrap_or(self.cfg.max_iterations),
            timeout_ms: opts.timeout_ms.unwrap_or(self.cfg.timeout_ms),
            action_delay_ms: opts.action_delay_ms.unwrap_or(self.cfg.action_delay_ms),
            vision_available,
            vision_active: false,
            usage: LlmUsage::default(),
            history: Vec::new(),
            actions: Vec::new(),
            recent: VecDeque::new(),
            consecutive_failures: 0,
            peak_rss_kb: None,
            log: self
                .cfg
                .log_dir
                .as_deref()
                .map(|dir| RunLog::new(dir, &url, &opts.prompt)),
        };

        if opts.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
            return Ok(self
                .finish(
                    &mut state,
                    AgentStatus::Aborted,
                    RunTier::Http,
                    None,
                    Some("Cancelled by caller".into()),
                )
                .await);
        }

        // One-shot static attempt; any miss escalates to the browser.
        if let Some(result) = self.static_attempt(&mut state, &opts).await {
            return Ok(result);
        }

        self.emit(RunEvent::Tier { tier: RunTier::Browser });
        if let Some(log) = &mut state.log {
            log.tier(RunTier::Browser);
        }

        let browser = self.checkout_browser().await?;
        let page = match browser.new_page(&self.page_options()).await {
            Ok(page) => page,
            Err(e) => {
                let result = self
                    .finish(
                        &mut state,
                        AgentStatus::Error,
                        RunTier::Browser,
                        None,
                        Some(format!("Browser context failed: {}", e)),
                    )
                    .await;
                self.checkin_browser(browser).await;
                return Ok(result);
            }
        };

        let result = match page.goto(&url, self.cfg.navigation_timeout_ms).await {
            Ok(()) => self.interactive_loop(&mut state, &opts, page.as_ref()).await,
            Err(e) => {
                self.finish(
                    &mut state,
                    AgentStatus::Error,
                    RunTier::Browser,
                    None,
                    Some(format!("Navigation failed: {}", e)),
                )
                .await
            }
        };

        page.close().await;
        self.checkin_browser(browser).await;
        Ok(result)
    }

    fn page_options(&self) -> PageOptions {
        PageOptions {
            viewport: Some((1280, 800)),
            init_script: Some(STEALTH_INIT_SCRIPT.to_string()),
            cookies: self.cfg.cookies.clone(),
            extra_headers: self.cfg.extra_headers.clone(),
            auto_dismiss_dialogs: true,
            ..PageOptions::default()
        }
    }

    async fn checkout_browser(&self) -> Result<Arc<dyn BrowserHandle>, AgentError> {
        if let Some(pool) = &self.pool {
            return pool.acquire().await;
        }
        let mut own = self.own_browser.lock().await;
        if let Some(browser) = own.as_ref() {
            if browser.is_connected() {
                return Ok(browser.clone());
            }
            *own = None;
        }
        let browser = self.launcher.launch().await?;
        *own = Some(browser.clone());
        Ok(browser)
    }

    async fn checkin_browser(&self, browser: Arc<dyn BrowserHandle>) {
        if let Some(pool) = &self.pool {
            pool.release(browser).await;
        }
        // An owned browser stays resident for the next run.
    }

    /// Try to resolve the task from raw HTML in a single LLM call. Returns
    /// `None` (escalate to the browser, usage preserved) on any miss.
    async fn static_attempt(
        &self,
        state: &mut RunState,
        opts: &RunOptions,
    ) -> Option<AgentResult> {
        self.emit(RunEvent::Tier { tier: RunTier::Http });
        if let Some(log) = &mut state.log {
            log.tier(RunTier::Http);
        }

        let fetched = self.fetcher.fetch(&state.url).await.ok()?;
        if fetched.status >= 400 {
            return None;
        }
        let ctype = fetched.content_type.to_lowercase();
        if !ctype.contains("text/html") && !ctype.contains("text/plain") {
            return None;
        }
        if !extract::has_enough_content(&fetched.body) {
            return None;
        }

        let base = url::Url::parse(&state.url).ok()?;
        let snap = snapshot::from_html(&fetched.body, &base);
        self.emit(RunEvent::Iteration {
            index: 0,
            url: snap.url.clone(),
        });
        if let Some(log) = &mut state.log {
            log.iteration(
                0,
                &snap.url,
                &snap.title,
                snap.text.chars().count(),
                snap.links.len(),
                snap.forms.len(),
            );
        }

        let system = prompt::system_prompt(false);
        let schema_desc = opts.output_schema.as_ref().map(|s| s.description.as_str());
        let user = prompt::build_user_message(&state.prompt, &snap.render(), &[], schema_desc);

        let (value, call_usage) = self.decider.decide(&system, &user, None).await.ok()?;
        state.usage.absorb(&call_usage);

        let parsed = action::parse_action_value(&value).ok()?;
        if let AgentAction::Done { result } = &parsed {
            state.record(&parsed, 0);
            self.emit(RunEvent::Action {
                index: 0,
                action: parsed.clone(),
            });
            let result = result.clone();
            return Some(self.finish_done(state, opts, &result, RunTier::Http).await);
        }
        // The model wants to interact; hand over to the browser with the
        // spent tokens carried forward.
        None
    }

    async fn interactive_loop(
        &self,
        state: &mut RunState,
        opts: &RunOptions,
        page: &dyn PageDriver,
    ) -> AgentResult {
        let schema_desc = opts.output_schema.as_ref().map(|s| s.description.clone());

        for i in 0..state.max_iterations {
            if opts.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                return self
                    .finish(
                        state,
                        AgentStatus::Aborted,
                        RunTier::Browser,
                        None,
                        Some("Cancelled by caller".into()),
                    )
                    .await;
            }

            self.sample_rss(state);

            if state.start.elapsed().as_millis() as u64 > state.timeout_ms {
                let timeout_ms = state.timeout_ms;
                return self
                    .finish(
                        state,
                        AgentStatus::Timeout,
                        RunTier::Browser,
                        None,
                        Some(format!("Deadline of {} ms exceeded", timeout_ms)),
                    )
                    .await;
            }

            if self.cfg.max_total_tokens > 0
                && state.usage.total_tokens >= self.cfg.max_total_tokens
            {
                let used = state.usage.total_tokens;
                return self
                    .finish(
                        state,
                        AgentStatus::Error,
                        RunTier::Browser,
                        None,
                        Some(format!(
                            "Token budget exceeded ({} of {} tokens used)",
                            used, self.cfg.max_total_tokens
                        )),
                    )
                    .await;
            }

            let snap = snapshot::from_page(page, true).await;
            self.emit(RunEvent::Iteration {
                index: i,
                url: snap.url.clone(),
            });
            if let Some(log) = &mut state.log {
                log.iteration(
                    i,
                    &snap.url,
                    &snap.title,
                    snap.text.chars().count(),
                    snap.links.len(),
                    snap.forms.len(),
                );
            }

            if let Some(reason) = is_blocked_page(&snap, self.cfg.blocked_text_threshold) {
                return self
                    .finish(
                        state,
                        AgentStatus::Error,
                        RunTier::Browser,
                        None,
                        Some(format!("Blocked by target site: {}", reason)),
                    )
                    .await;
            }

            let screenshot = if state.vision_active {
                page.screenshot_jpeg(self.cfg.screenshot_quality).await.ok()
            } else {
                None
            };

            let system = prompt::system_prompt(state.vision_available);
            let user = prompt::build_user_message(
                &state.prompt,
                &snap.render(),
                &state.history,
                schema_desc.as_deref(),
            );

            let value = match self
                .decider
                .decide(&system, &user, screenshot.as_deref())
                .await
            {
                Ok((value, call_usage)) => {
                    state.usage.absorb(&call_usage);
                    value
                }
                Err(AgentError::InvalidAction(msg)) => {
                    state.invalid_action(i, &msg);
                    continue;
                }
                Err(e) => {
                    return self
                        .finish(
                            state,
                            AgentStatus::Error,
                            RunTier::Browser,
                            None,
                            Some(e.to_string()),
                        )
                        .await;
                }
            };

            let agent_action = match action::parse_action_value(&value) {
                Ok(a) => a,
                Err(e) => {
                    state.invalid_action(i, &e.to_string());
                    continue;
                }
            };

            state.record(&agent_action, i);
            self.emit(RunEvent::Action {
                index: i,
                action: agent_action.clone(),
            });

            if let AgentAction::Done { result } = &agent_action {
                let result = result.clone();
                return self.finish_done(state, opts, &result, RunTier::Browser).await;
            }

            // Loop detection over the canonicalized key: the third identical
            // action within the window is suppressed, not executed.
            let key = agent_action.key();
            state.push_recent(key.clone());
            if state.is_stuck(&key) {
                state.consecutive_failures += 1;
                state.history.push(format!(
                    "[{}] STUCK: the same action was chosen {} times. Take a completely different approach.",
                    i, MAX_OCCURRENCES
                ));
                state.recent.clear();
                state.maybe_escalate_vision(i);
                continue;
            }

            match exec::execute_with_resolver(
                self.resolver.as_ref(),
                page,
                &agent_action,
                &self.cfg.allowed_domains,
                &self.cfg.blocked_domains,
            )
            .await
            {
                Ok(()) => {
                    state
                        .history
                        .push(format!("[{}] {} -> OK", i, agent_action.describe()));
                    if let Some(log) = &mut state.log {
                        log.action_ok(i);
                    }
                    state.consecutive_failures = 0;
                }
                Err(e) => {
                    state.consecutive_failures += 1;
                    state.history.push(format!(
                        "[{}] ERROR executing {}: {}. Try a different approach.",
                        i,
                        agent_action.kind(),
                        e
                    ));
                    if let Some(log) = &mut state.log {
                        log.action_err(i, &e.to_string());
                    }
                    state.maybe_escalate_vision(i);
                    continue;
                }
            }

            // wait and goto are self-timed; everything else gets the
            // inter-action settle delay.
            if !matches!(
                agent_action,
                AgentAction::Wait { .. } | AgentAction::Goto { .. }
            ) {
                tokio::time::sleep(Duration::from_millis(state.action_delay_ms)).await;
            }
        }

        let max = state.max_iterations;
        self.finish(
            state,
            AgentStatus::MaxIterations,
            RunTier::Browser,
            None,
            Some(format!("Reached maximum iterations ({})", max)),
        )
        .await
    }

    async fn finish_done(
        &self,
        state: &mut RunState,
        opts: &RunOptions,
        result: &str,
        tier: RunTier,
    ) -> AgentResult {
        let trimmed = result.trim();
        if let Some(rest) = trimmed.strip_prefix("FAILED:") {
            let message = rest.trim();
            let message = if message.is_empty() { "Task failed" } else { message };
            return self
                .finish(state, AgentStatus::Error, tier, None, Some(message.to_string()))
                .await;
        }

        let data: Value =
            serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(result.to_string()));
        if let Some(schema) = &opts.output_schema {
            if let Err(e) = (schema.validator)(&data) {
                return self
                    .finish(
                        state,
                        AgentStatus::Error,
                        tier,
                        None,
                        Some(format!(
                            "result did not match the required output schema: {}",
                            e
                        )),
                    )
                    .await;
            }
        }
        self.finish(state, AgentStatus::Done, tier, Some(data), None).await
    }

    async fn finish(
        &self,
        state: &mut RunState,
        status: AgentStatus,
        tier: RunTier,
        data: Option<Value>,
        error: Option<String>,
    ) -> AgentResult {
        let duration_ms = state.start.elapsed().as_millis() as u64;
        let memory = MemoryStats {
            browser_peak_rss_kb: state.peak_rss_kb,
            process_heap_mb: process_heap_mb(),
        };

        let data_str = data.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        let report = render_report(
            &state.url,
            &state.prompt,
            &status,
            tier,
            duration_ms,
            &state.actions,
            data_str.as_deref(),
            error.as_deref(),
            &state.usage,
            &memory,
        );

        match &error {
            Some(message) => {
                warn!(status = status.as_str(), %message, "run finished");
                self.emit(RunEvent::Error {
                    message: message.clone(),
                });
            }
            None => {
                info!(status = status.as_str(), tier = tier.as_str(), "run finished");
            }
        }
        self.emit(RunEvent::Done { status });

        if let Some(mut log) = state.log.take() {
            log.finish(
                &status,
                duration_ms,
                &state.usage,
                state.actions.len(),
                data_str.as_deref(),
            );
            log.write().await;
        }

        AgentResult {
            status,
            tier,
            data,
            report,
            duration_ms,
            actions: std::mem::take(&mut state.actions),
            usage: state.usage,
            memory,
            error,
        }
    }
}

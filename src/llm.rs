//! One-shot decision calls against a chat-completion endpoint: JSON mode,
//! optional vision attachment, transient retry with exponential backoff, and
//! token accounting.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::AgentConfig;
use crate::error::AgentError;

/// Retries after a transient failure; the initial call is not counted.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1_000;

/// Models that accept image parts, matched by case-insensitive prefix.
pub const VISION_MODEL_PREFIXES: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4-turbo",
    "gpt-4.1",
    "gpt-4.1-mini",
    "gpt-4.1-nano",
    "meta-llama/llama-4-scout",
    "meta-llama/llama-4-maverick",
];

pub fn is_vision_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    VISION_MODEL_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Warn once per process per model when vision is requested on a model that
/// cannot use it. Duplicate warnings from racing runs are harmless.
pub fn warn_non_vision_model(model: &str) {
    static WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    let memo = WARNED.get_or_init(|| Mutex::new(HashSet::new()));
    let mut guard = memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.insert(model.to_string()) {
        warn!(model, "vision requested but model is not vision-capable; screenshots disabled");
    }
}

/// Cumulative token accounting for one run. Monotonic.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub calls: u64,
}

impl LlmUsage {
    pub fn absorb(&mut self, other: &LlmUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.calls += other.calls;
    }
}

/// Decision seam: the production client plus any scripted test double.
#[async_trait]
pub trait Decider: Send + Sync {
    /// Returns the parsed JSON object the model produced plus the usage of
    /// this single call.
    async fn decide(
        &self,
        system: &str,
        user: &str,
        screenshot_b64: Option<&str>,
    ) -> Result<(Value, LlmUsage), AgentError>;
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    cfg: AgentConfig,
}

impl LlmClient {
    pub fn new(cfg: AgentConfig) -> Result<Self, AgentError> {
        cfg.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {}", e)))?;
        Ok(Self { http, cfg })
    }

    fn request_body(&self, system: &str, user: &str, screenshot_b64: Option<&str>) -> Value {
        let user_content = match screenshot_b64 {
            None => Value::String(user.to_string()),
            Some(b64) => json!([
                { "type": "text", "text": user },
                { "type": "image_url", "image_url": {
                    "url": format!("data:image/jpeg;base64,{}", b64)
                }}
            ]),
        };

        let mut body = json!({
            "model": self.cfg.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user_content }
            ],
            "temperature": self.cfg.temperature,
            "max_completion_tokens": self.cfg.max_completion_tokens,
        });
        if let Some(top_p) = self.cfg.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(fp) = self.cfg.frequency_penalty {
            body["frequency_penalty"] = json!(fp);
        }
        if let Some(pp) = self.cfg.presence_penalty {
            body["presence_penalty"] = json!(pp);
        }
        // Providers widely mishandle JSON mode combined with image parts, so
        // the response-format hint is only sent for text-only requests.
        if screenshot_b64.is_none() {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    async fn call_once(
        &self,
        system: &str,
        user: &str,
        screenshot_b64: Option<&str>,
    ) -> Result<(Value, LlmUsage), AgentError> {
        let url = format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        let body = self.request_body(system, user, screenshot_b64);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_network_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(classify_network_error)?;
        if !status.is_success() {
            let message = format!("llm endpoint returned {}: {}", status, clip(&text, 400));
            return if transient_status(status.as_u16()) {
                Err(AgentError::LlmTransient(message))
            } else {
                Err(AgentError::Llm(message))
            };
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| AgentError::Llm(format!("unparseable llm response: {}", e)))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Llm("llm response had no choices".into()))?;

        if choice.finish_reason.as_deref() == Some("length") {
            return Err(AgentError::Llm(
                "llm response was truncated; raise max_completion_tokens".into(),
            ));
        }
        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AgentError::Llm("llm response content was empty".into()));
        }

        let data: Value = serde_json::from_str(strip_fences(&content))
            .map_err(|e| AgentError::InvalidAction(format!("model output was not JSON: {}", e)))?;

        let usage = parsed.usage.unwrap_or_default();
        Ok((
            data,
            LlmUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
                calls: 1,
            },
        ))
    }
}

#[async_trait]
impl Decider for LlmClient {
    async fn decide(
        &self,
        system: &str,
        user: &str,
        screenshot_b64: Option<&str>,
    ) -> Result<(Value, LlmUsage), AgentError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(system, user, screenshot_b64).await {
                Ok(out) => return Ok(out),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let delay = RETRY_BASE_MS * (1 << attempt);
                    warn!(attempt, delay_ms = delay, error = %e, "transient llm failure, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<UsageTriple>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Default, Deserialize)]
struct UsageTriple {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

pub(crate) fn transient_status(code: u16) -> bool {
    code == 429 || code == 408 || code >= 500
}

fn classify_network_error(e: reqwest::Error) -> AgentError {
    let message = e.to_string();
    if e.is_timeout() || e.is_connect() || transient_network_message(&message) {
        AgentError::LlmTransient(message)
    } else {
        AgentError::Llm(message)
    }
}

pub(crate) fn transient_network_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["econnreset", "etimedout", "socket hang up", "fetch failed"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Models sometimes wrap JSON in markdown fences despite instructions.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vision_models_match_by_prefix_case_insensitively() {
        assert!(is_vision_model("gpt-4o"));
        assert!(is_vision_model("GPT-4o-2024-08-06"));
        assert!(is_vision_model("meta-llama/llama-4-scout-17b"));
        assert!(!is_vision_model("gpt-3.5-turbo"));
        assert!(!is_vision_model("claude-3-opus"));
    }

    #[test]
    fn transient_classification_covers_status_and_messages() {
        for code in [429u16, 408, 500, 502, 503] {
            assert!(transient_status(code), "{} should be transient", code);
        }
        for code in [400u16, 401, 403, 404] {
            assert!(!transient_status(code), "{} should be fatal", code);
        }
        assert!(transient_network_message("error sending request: ECONNRESET"));
        assert!(transient_network_message("socket hang up"));
        assert!(!transient_network_message("invalid api key"));
    }

    #[test]
    fn usage_accumulates_monotonically() {
        let mut total = LlmUsage::default();
        let call = LlmUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
            calls: 1,
        };
        total.absorb(&call);
        total.absorb(&call);
        assert_eq!(total.total_tokens, 240);
        assert_eq!(total.calls, 2);
    }

    #[test]
    fn fences_are_stripped_before_parsing() {
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn request_body_shape_tracks_vision() {
        let cfg = AgentConfig {
            api_key: "k".into(),
            ..Default::default()
        };
        let client = LlmClient::new(cfg).unwrap();
        let text_only = client.request_body("sys", "user", None);
        assert_eq!(text_only["response_format"]["type"], "json_object");
        assert!(text_only["messages"][1]["content"].is_string());

        let with_image = client.request_body("sys", "user", Some("QUJD"));
        assert!(with_image.get("response_format").is_none());
        let parts = with_image["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }
}

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

pub const MAX_SELECTOR_LEN: usize = 500;
pub const MAX_TYPE_TEXT_LEN: usize = 1_000;
pub const MAX_SELECT_VALUE_LEN: usize = 500;
pub const MAX_DONE_RESULT_LEN: usize = 50_000;
pub const MIN_WAIT_MS: u64 = 1;
pub const MAX_WAIT_MS: u64 = 5_000;
pub const MIN_SCROLL_AMOUNT: u32 = 1;
pub const MAX_SCROLL_AMOUNT: u32 = 5_000;

/// Closed set of dispatchable keyboard keys.
pub const ALLOWED_KEYS: &[&str] = &[
    "Enter", "Tab", "Escape", "Backspace", "Delete", "ArrowUp", "ArrowDown", "ArrowLeft",
    "ArrowRight", "Home", "End", "PageUp", "PageDown", "Space", "F1", "F2", "F3", "F4", "F5",
    "F6", "F7", "F8", "F9", "F10", "F11", "F12",
];

/// One browser-facing step chosen by the model. Exactly one variant per
/// message; the serialized form is the JSON the model is asked to produce.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentAction {
    #[serde(rename = "click")]
    Click { selector: String },
    #[serde(rename = "type")]
    Type { selector: String, text: String },
    #[serde(rename = "select")]
    Select { selector: String, value: String },
    #[serde(rename = "pressKey")]
    PressKey { key: String },
    #[serde(rename = "hover")]
    Hover { selector: String },
    #[serde(rename = "goto")]
    Goto { url: String },
    #[serde(rename = "wait")]
    Wait { ms: u64 },
    #[serde(rename = "scroll")]
    Scroll {
        direction: ScrollDirection,
        #[serde(skip_serializing_if = "Option::is_none")]
        amount: Option<u32>,
    },
    #[serde(rename = "done")]
    Done { result: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrollDirection {
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "down")]
    Down,
}

impl AgentAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentAction::Click { .. } => "click",
            AgentAction::Type { .. } => "type",
            AgentAction::Select { .. } => "select",
            AgentAction::PressKey { .. } => "pressKey",
            AgentAction::Hover { .. } => "hover",
            AgentAction::Goto { .. } => "goto",
            AgentAction::Wait { .. } => "wait",
            AgentAction::Scroll { .. } => "scroll",
            AgentAction::Done { .. } => "done",
        }
    }

    /// Canonical key for loop detection: the serialized action with fixed
    /// quoting and no internal whitespace.
    pub fn key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Short human-readable form used in history lines and reports.
    pub fn describe(&self) -> String {
        match self {
            AgentAction::Click { selector } => format!("click \"{}\"", selector),
            AgentAction::Type { selector, text } => {
                format!("type \"{}\" into \"{}\"", clip(text, 60), selector)
            }
            AgentAction::Select { selector, value } => {
                format!("select \"{}\" in \"{}\"", clip(value, 60), selector)
            }
            AgentAction::PressKey { key } => format!("press {}", key),
            AgentAction::Hover { selector } => format!("hover \"{}\"", selector),
            AgentAction::Goto { url } => format!("goto {}", url),
            AgentAction::Wait { ms } => format!("wait {}ms", ms),
            AgentAction::Scroll { direction, amount } => {
                let dir = match direction {
                    ScrollDirection::Up => "up",
                    ScrollDirection::Down => "down",
                };
                match amount {
                    Some(px) => format!("scroll {} {}px", dir, px),
                    None => format!("scroll {}", dir),
                }
            }
            AgentAction::Done { .. } => "done".to_string(),
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}

fn role_selector_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^role=\w+(\[name="(?:[^"\\]|\\.)*"\])?$"#).unwrap())
}

fn on_event_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bon\w+\s*=").unwrap())
}

/// Accepts a trimmed CSS selector (with the unsafe-token blacklist applied)
/// or a `role=<word>[name="…"]` selector, which is trusted as-is.
fn validate_selector(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("selector is empty".into());
    }
    if trimmed.chars().count() > MAX_SELECTOR_LEN {
        return Err(format!("selector exceeds {} chars", MAX_SELECTOR_LEN));
    }
    if role_selector_re().is_match(trimmed) {
        return Ok(trimmed.to_string());
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("javascript:") {
        return Err("selector contains javascript: URL".into());
    }
    if lower.contains("<script") {
        return Err("selector contains script tag".into());
    }
    if lower.contains("data:") {
        return Err("selector contains data: URL".into());
    }
    if on_event_re().is_match(trimmed) {
        return Err("selector contains inline event handler".into());
    }
    Ok(trimmed.to_string())
}

fn expect_keys(obj: &serde_json::Map<String, Value>, allowed: &[&str]) -> Result<(), String> {
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(format!("unknown field \"{}\"", key));
        }
    }
    Ok(())
}

fn str_field<'a>(obj: &'a serde_json::Map<String, Value>, name: &str) -> Result<&'a str, String> {
    obj.get(name)
        .ok_or_else(|| format!("missing field \"{}\"", name))?
        .as_str()
        .ok_or_else(|| format!("field \"{}\" must be a string", name))
}

fn u64_field(obj: &serde_json::Map<String, Value>, name: &str) -> Result<u64, String> {
    obj.get(name)
        .ok_or_else(|| format!("missing field \"{}\"", name))?
        .as_u64()
        .ok_or_else(|| format!("field \"{}\" must be a non-negative integer", name))
}

/// Strict discriminated parse of the model's JSON into an [`AgentAction`].
///
/// Unknown `type` values and unknown keys are rejected; all string and
/// numeric bounds are enforced here. For `goto` the URL is only checked for
/// presence; the safety policy runs at execution time, where runtime
/// allow/block lists apply.
pub fn parse_action_value(raw: &Value) -> Result<AgentAction, AgentError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AgentError::InvalidAction("action must be a JSON object".into()))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::InvalidAction("missing \"type\" field".into()))?;

    let bad = |msg: String| AgentError::InvalidAction(format!("{}: {}", kind, msg));

    match kind {
        "click" => {
            expect_keys(obj, &["type", "selector"]).map_err(bad)?;
            let selector = validate_selector(str_field(obj, "selector").map_err(bad)?).map_err(bad)?;
            Ok(AgentAction::Click { selector })
        }
        "type" => {
            expect_keys(obj, &["type", "selector", "text"]).map_err(bad)?;
            let selector = validate_selector(str_field(obj, "selector").map_err(bad)?).map_err(bad)?;
            let text = str_field(obj, "text").map_err(bad)?.to_string();
            if text.chars().count() > MAX_TYPE_TEXT_LEN {
                return Err(bad(format!("text exceeds {} chars", MAX_TYPE_TEXT_LEN)));
            }
            Ok(AgentAction::Type { selector, text })
        }
        "select" => {
            expect_keys(obj, &["type", "selector", "value"]).map_err(bad)?;
            let selector = validate_selector(str_field(obj, "selector").map_err(bad)?).map_err(bad)?;
            let value = str_field(obj, "value").map_err(bad)?.to_string();
            if value.chars().count() > MAX_SELECT_VALUE_LEN {
                return Err(bad(format!("value exceeds {} chars", MAX_SELECT_VALUE_LEN)));
            }
            Ok(AgentAction::Select { selector, value })
        }
        "pressKey" => {
            expect_keys(obj, &["type", "key"]).map_err(bad)?;
            let key = str_field(obj, "key").map_err(bad)?;
            if !ALLOWED_KEYS.contains(&key) {
                return Err(bad(format!("key \"{}\" is not in the allowed set", key)));
            }
            Ok(AgentAction::PressKey {
                key: key.to_string(),
            })
        }
        "hover" => {
            expect_keys(obj, &["type", "selector"]).map_err(bad)?;
            let selector = validate_selector(str_field(obj, "selector").map_err(bad)?).map_err(bad)?;
            Ok(AgentAction::Hover { selector })
        }
        "goto" => {
            expect_keys(obj, &["type", "url"]).map_err(bad)?;
            let url = str_field(obj, "url").map_err(bad)?.trim().to_string();
            if url.is_empty() {
                return Err(bad("url is empty".into()));
            }
            Ok(AgentAction::Goto { url })
        }
        "wait" => {
            expect_keys(obj, &["type", "ms"]).map_err(bad)?;
            let ms = u64_field(obj, "ms").map_err(bad)?;
            if !(MIN_WAIT_MS..=MAX_WAIT_MS).contains(&ms) {
                return Err(bad(format!("ms must be within {}..={}", MIN_WAIT_MS, MAX_WAIT_MS)));
            }
            Ok(AgentAction::Wait { ms })
        }
        "scroll" => {
            expect_keys(obj, &["type", "direction", "amount"]).map_err(bad)?;
            let direction = match str_field(obj, "direction").map_err(bad)? {
                "up" => ScrollDirection::Up,
                "down" => ScrollDirection::Down,
                other => return Err(bad(format!("direction \"{}\" must be up or down", other))),
            };
            let amount = match obj.get("amount") {
                None | Some(Value::Null) => None,
                Some(v) => {
                    let px = v
                        .as_u64()
                        .ok_or_else(|| bad("amount must be a positive integer".into()))?;
                    let px = u32::try_from(px)
                        .map_err(|_| bad(format!("amount exceeds {}", MAX_SCROLL_AMOUNT)))?;
                    if !(MIN_SCROLL_AMOUNT..=MAX_SCROLL_AMOUNT).contains(&px) {
                        return Err(bad(format!(
                            "amount must be within {}..={}",
                            MIN_SCROLL_AMOUNT, MAX_SCROLL_AMOUNT
                        )));
                    }
                    Some(px)
                }
            };
            Ok(AgentAction::Scroll { direction, amount })
        }
        "done" => {
            expect_keys(obj, &["type", "result"]).map_err(bad)?;
            let result = str_field(obj, "result").map_err(bad)?.to_string();
            if result.chars().count() > MAX_DONE_RESULT_LEN {
                return Err(bad(format!("result exceeds {} chars", MAX_DONE_RESULT_LEN)));
            }
            Ok(AgentAction::Done { result })
        }
        other => Err(AgentError::InvalidAction(format!(
            "unknown action type \"{}\"",
            other
        ))),
    }
}

/// Parse from raw model text (must be a single JSON object).
pub fn parse_action(raw: &str) -> Result<AgentAction, AgentError> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| AgentError::InvalidAction(format!("not valid JSON: {}", e)))?;
    parse_action_value(&value)
}

use thiserror::Error;

/// Error sum for the whole engine.
///
/// Loop-internal failures (invalid actions, execution errors, transient LLM
/// hiccups) are recovered inside the run and become history entries; only
/// configuration, URL-safety, and pool failures escape `Agent::run`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unsafe url: {0}")]
    UnsafeUrl(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Retryable LLM/transport failure (429/408/5xx, connection resets).
    #[error("llm transient error: {0}")]
    LlmTransient(String),

    /// Non-retryable LLM failure: empty content, truncated response,
    /// non-transient HTTP status, unparseable JSON.
    #[error("llm error: {0}")]
    Llm(String),

    #[error("browser error: {0}")]
    Browser(String),

    /// Per-action execution failure (timeout, element not found).
    #[error("execution error: {0}")]
    Execution(String),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("scrape error: {0}")]
    Scrape(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::LlmTransient(_))
    }
}

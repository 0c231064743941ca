//! Human-readable run report and the optional per-run plain-text log file.

use chrono::{SecondsFormat, Utc};
use tracing::warn;

use crate::agent::{ActionRecord, AgentStatus, MemoryStats, RunTier};
use crate::llm::LlmUsage;

const MAX_REPORT_DATA_CHARS: usize = 10_000;

pub(crate) fn truncate_for_report(data: &str) -> String {
    if data.chars().count() <= MAX_REPORT_DATA_CHARS {
        return data.to_string();
    }
    let cut: String = data.chars().take(MAX_REPORT_DATA_CHARS).collect();
    format!("{}… (truncated)", cut)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn render_report(
    url: &str,
    prompt: &str,
    status: &AgentStatus,
    tier: RunTier,
    duration_ms: u64,
    actions: &[ActionRecord],
    data: Option<&str>,
    error: Option<&str>,
    usage: &LlmUsage,
    memory: &MemoryStats,
) -> String {
    let mut out = String::new();
    out.push_str("=== Auspex Run Report ===\n");
    out.push_str(&format!("URL: {}\n", url));
    out.push_str(&format!("Prompt: {}\n", prompt));
    out.push_str(&format!("Status: {}\n", status.as_str()));
    out.push_str(&format!("Method: {}\n", tier.as_str()));
    out.push_str(&format!("Duration: {} ms\n", duration_ms));

    out.push_str("Steps:\n");
    if actions.is_empty() {
        out.push_str("  (none)\n");
    }
    for (n, record) in actions.iter().enumerate() {
        out.push_str(&format!(
            "  {}. [iter {}] {}\n",
            n + 1,
            record.iteration,
            record.action.describe()
        ));
    }

    match (data, error) {
        (Some(data), _) => {
            out.push_str("Result:\n");
            out.push_str(&truncate_for_report(data));
            out.push('\n');
        }
        (None, Some(err)) => {
            out.push_str(&format!("Error: {}\n", err));
        }
        (None, None) => out.push_str("Result: (none)\n"),
    }

    out.push_str("Resource Usage:\n");
    out.push_str(&format!(
        "  LLM calls: {} (prompt {}, completion {}, total {} tokens)\n",
        usage.calls, usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
    ));
    let heap = memory
        .process_heap_mb
        .map(|mb| format!("{:.1} MB", mb))
        .unwrap_or_else(|| "not available".to_string());
    let rss = match (tier, memory.browser_peak_rss_kb) {
        (RunTier::Http, _) => "not used".to_string(),
        (RunTier::Browser, Some(kb)) => format!("{} kB", kb),
        (RunTier::Browser, None) => "not available".to_string(),
    };
    out.push_str(&format!(
        "  Memory: process heap {}, browser peak RSS {}\n",
        heap, rss
    ));
    out
}

/// Collects one line per event during a run and persists them as
/// `<dir>/auspex-<iso-timestamp>.txt` at the end. Best-effort: I/O errors
/// are logged, never surfaced.
pub(crate) struct RunLog {
    dir: String,
    lines: Vec<String>,
}

impl RunLog {
    pub fn new(dir: &str, url: &str, prompt: &str) -> Self {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut log = Self {
            dir: dir.to_string(),
            lines: Vec::new(),
        };
        log.push(format!("=== Auspex Run — {} ===", stamp));
        log.push(format!("URL: {}", url));
        log.push(format!("Prompt: {}", prompt));
        log
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn tier(&mut self, tier: RunTier) {
        self.push(format!("[{}]", tier.as_str()));
    }

    pub fn iteration(&mut self, n: u32, url: &str, title: &str, text_len: usize, links: usize, forms: usize) {
        self.push(format!("[iter {}] {}", n, url));
        self.push(format!("  title: {}", title));
        self.push(format!("  text ({} chars) | {} links | {} forms", text_len, links, forms));
    }

    pub fn action(&mut self, n: u32, description: &str) {
        self.push(format!("  [action {}] {}", n, description));
    }

    pub fn action_ok(&mut self, n: u32) {
        self.push(format!("  [action {}] -> OK", n));
    }

    pub fn action_err(&mut self, n: u32, message: &str) {
        self.push(format!("  [action {}] -> ERROR: {}", n, message));
    }

    pub fn finish(
        &mut self,
        status: &AgentStatus,
        duration_ms: u64,
        usage: &LlmUsage,
        actions: usize,
        data: Option<&str>,
    ) {
        self.push(format!("Status: {}", status.as_str()));
        self.push(format!("Duration: {} ms", duration_ms));
        self.push(format!(
            "Tokens: {} (prompt {}, completion {})",
            usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
        ));
        self.push(format!("Actions: {}", actions));
        if let Some(data) = data {
            self.push(format!("Data: {}", truncate_for_report(data)));
        }
    }

    pub async fn write(self) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true).replace(':', "-");
        let path = format!("{}/auspex-{}.txt", self.dir.trim_end_matches('/'), stamp);
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir, error = %e, "could not create log directory");
            return;
        }
        let body = self.lines.join("\n") + "\n";
        if let Err(e) = tokio::fs::write(&path, body).await {
            warn!(path = %path, error = %e, "could not write run log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::AgentAction;

    fn record(action: AgentAction, iteration: u32) -> ActionRecord {
        ActionRecord {
            action,
            iteration,
            at_epoch_ms: 0,
        }
    }

    #[test]
    fn report_carries_all_sections() {
        let usage = LlmUsage {
            prompt_tokens: 100,
            completion_tokens: 30,
            total_tokens: 130,
            calls: 2,
        };
        let actions = vec![
            record(AgentAction::Click { selector: "#go".into() }, 0),
            record(AgentAction::Done { result: "x".into() }, 1),
        ];
        let report = render_report(
            "https://example.com/",
            "find x",
            &AgentStatus::Done,
            RunTier::Browser,
            1_500,
            &actions,
            Some("x"),
            None,
            &usage,
            &MemoryStats {
                browser_peak_rss_kb: Some(2_048),
                process_heap_mb: Some(80.5),
            },
        );
        assert!(report.contains("Status: done"));
        assert!(report.contains("Method: browser"));
        assert!(report.contains("1. [iter 0] click \"#go\""));
        assert!(report.contains("LLM calls: 2"));
        assert!(report.contains("2048 kB"));
    }

    #[test]
    fn http_tier_reports_browser_memory_as_not_used() {
        let report = render_report(
            "https://example.com/",
            "p",
            &AgentStatus::Done,
            RunTier::Http,
            10,
            &[],
            Some("d"),
            None,
            &LlmUsage::default(),
            &MemoryStats::default(),
        );
        assert!(report.contains("browser peak RSS not used"));
    }

    #[test]
    fn oversized_result_data_is_truncated() {
        let big = "a".repeat(20_000);
        let cut = truncate_for_report(&big);
        assert!(cut.len() < big.len());
        assert!(cut.ends_with("… (truncated)"));
    }
}

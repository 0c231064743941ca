//! Translation of validated actions into page-driver operations, with the
//! fixed per-action timeout table and runtime URL re-validation for `goto`.

use std::time::Duration;

use crate::action::{AgentAction, ScrollDirection};
use crate::driver::{LoadState, Locator, PageDriver};
use crate::error::AgentError;
use crate::safety::{self, Resolve, SystemResolver};

pub const CLICK_TIMEOUT_MS: u64 = 10_000;
pub const INPUT_TIMEOUT_MS: u64 = 5_000;
pub const SETTLE_TIMEOUT_MS: u64 = 5_000;
pub const GOTO_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SCROLL_AMOUNT: u32 = 500;

/// Execute one action against the page. `done` is a no-op here; the loop
/// owns termination.
pub async fn execute(
    page: &dyn PageDriver,
    action: &AgentAction,
    allow: &[String],
    block: &[String],
) -> Result<(), AgentError> {
    execute_with_resolver(&SystemResolver, page, action, allow, block).await
}

pub async fn execute_with_resolver(
    resolver: &dyn Resolve,
    page: &dyn PageDriver,
    action: &AgentAction,
    allow: &[String],
    block: &[String],
) -> Result<(), AgentError> {
    match action {
        AgentAction::Click { selector } => {
            page.click(&Locator::parse(selector), CLICK_TIMEOUT_MS).await?;
            // A click may navigate; give the new document a bounded chance
            // to settle, but don't fail the action if it doesn't.
            let _ = page
                .wait_for_load(LoadState::DomContentLoaded, SETTLE_TIMEOUT_MS)
                .await;
            Ok(())
        }
        AgentAction::Type { selector, text } => {
            page.fill(&Locator::parse(selector), text, INPUT_TIMEOUT_MS).await
        }
        AgentAction::Select { selector, value } => {
            page.select_value(&Locator::parse(selector), value, INPUT_TIMEOUT_MS)
                .await
        }
        AgentAction::PressKey { key } => {
            page.press_key(key).await?;
            if key.eq_ignore_ascii_case("enter") {
                let _ = page
                    .wait_for_load(LoadState::DomContentLoaded, SETTLE_TIMEOUT_MS)
                    .await;
            }
            Ok(())
        }
        AgentAction::Hover { selector } => {
            page.hover(&Locator::parse(selector), INPUT_TIMEOUT_MS).await
        }
        AgentAction::Goto { url } => {
            // Parse-time validation only checked shape; the safety policy
            // runs here where the runtime allow/block lists are known.
            let canonical = safety::validate_url_with(resolver, url, allow, block).await?;
            page.goto(&canonical, GOTO_TIMEOUT_MS).await
        }
        AgentAction::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            Ok(())
        }
        AgentAction::Scroll { direction, amount } => {
            let px = i64::from(amount.unwrap_or(DEFAULT_SCROLL_AMOUNT));
            let dy = match direction {
                ScrollDirection::Up => -px,
                ScrollDirection::Down => px,
            };
            page.evaluate(&format!("window.scrollBy(0, {})", dy)).await?;
            Ok(())
        }
        AgentAction::Done { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Default)]
    struct RecordingPage {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingPage {
        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageDriver for RecordingPage {
        async fn goto(&self, url: &str, _timeout_ms: u64) -> Result<(), AgentError> {
            self.log(format!("goto {}", url));
            Ok(())
        }
        async fn current_url(&self) -> String {
            "https://example.com/".into()
        }
        async fn title(&self) -> Result<String, AgentError> {
            Ok("t".into())
        }
        async fn content(&self) -> Result<String, AgentError> {
            Ok(String::new())
        }
        async fn evaluate(&self, js: &str) -> Result<Value, AgentError> {
            self.log(format!("evaluate {}", js));
            Ok(Value::Null)
        }
        async fn click(&self, locator: &Locator, timeout_ms: u64) -> Result<(), AgentError> {
            self.log(format!("click {:?} t={}", locator, timeout_ms));
            Ok(())
        }
        async fn fill(
            &self,
            locator: &Locator,
            text: &str,
            timeout_ms: u64,
        ) -> Result<(), AgentError> {
            self.log(format!("fill {:?} {:?} t={}", locator, text, timeout_ms));
            Ok(())
        }
        async fn select_value(
            &self,
            locator: &Locator,
            value: &str,
            _timeout_ms: u64,
        ) -> Result<(), AgentError> {
            self.log(format!("select {:?} {:?}", locator, value));
            Ok(())
        }
        async fn hover(&self, locator: &Locator, _timeout_ms: u64) -> Result<(), AgentError> {
            self.log(format!("hover {:?}", locator));
            Ok(())
        }
        async fn press_key(&self, key: &str) -> Result<(), AgentError> {
            self.log(format!("press {}", key));
            Ok(())
        }
        async fn wait_for_load(
            &self,
            _state: LoadState,
            _timeout_ms: u64,
        ) -> Result<(), AgentError> {
            self.log("wait_for_load");
            Ok(())
        }
        async fn wait_for_selector(&self, _css: &str, _timeout_ms: u64) -> Result<(), AgentError> {
            Ok(())
        }
        async fn screenshot_jpeg(&self, _quality: u8) -> Result<String, AgentError> {
            Ok(String::new())
        }
        async fn ax_tree(&self) -> Result<String, AgentError> {
            Ok(String::new())
        }
        async fn json_responses(&self) -> Vec<Value> {
            Vec::new()
        }
        async fn close(&self) {}
    }

    struct PublicResolver;

    #[async_trait]
    impl Resolve for PublicResolver {
        async fn resolve(&self, _host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
            Ok(vec![SocketAddr::new(
                "93.184.216.34".parse::<IpAddr>().unwrap(),
                port,
            )])
        }
    }

    #[tokio::test]
    async fn click_settles_after_dispatch() {
        let page = RecordingPage::default();
        let action = AgentAction::Click { selector: "#go".into() };
        execute_with_resolver(&PublicResolver, &page, &action, &[], &[])
            .await
            .unwrap();
        let calls = page.calls();
        assert!(calls[0].starts_with("click Css(\"#go\")"));
        assert!(calls[0].contains("t=10000"));
        assert_eq!(calls[1], "wait_for_load");
    }

    #[tokio::test]
    async fn enter_waits_for_the_new_document_but_tab_does_not() {
        let page = RecordingPage::default();
        execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::PressKey { key: "Enter".into() },
            &[],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(page.calls(), vec!["press Enter", "wait_for_load"]);

        let page = RecordingPage::default();
        execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::PressKey { key: "Tab".into() },
            &[],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(page.calls(), vec!["press Tab"]);
    }

    #[tokio::test]
    async fn scroll_defaults_to_500_and_honors_direction() {
        let page = RecordingPage::default();
        execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::Scroll { direction: ScrollDirection::Down, amount: None },
            &[],
            &[],
        )
        .await
        .unwrap();
        execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::Scroll { direction: ScrollDirection::Up, amount: Some(120) },
            &[],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(
            page.calls(),
            vec![
                "evaluate window.scrollBy(0, 500)",
                "evaluate window.scrollBy(0, -120)"
            ]
        );
    }

    #[tokio::test]
    async fn goto_revalidates_and_blocks_private_targets() {
        let page = RecordingPage::default();
        let err = execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::Goto { url: "http://127.0.0.1/admin".into() },
            &[],
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::UnsafeUrl(_)));
        assert!(page.calls().is_empty());

        execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::Goto { url: "https://example.com/next".into() },
            &[],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(page.calls(), vec!["goto https://example.com/next"]);
    }

    #[tokio::test]
    async fn goto_honors_runtime_blocklists() {
        let page = RecordingPage::default();
        let block = vec!["example.com".to_string()];
        let err = execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::Goto { url: "https://example.com/x".into() },
            &[],
            &block,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::UnsafeUrl(_)));
    }

    #[tokio::test]
    async fn role_selectors_reach_the_driver_as_role_locators() {
        let page = RecordingPage::default();
        execute_with_resolver(
            &PublicResolver,
            &page,
            &AgentAction::Click { selector: "role=button[name=\"Go\"]".into() },
            &[],
            &[],
        )
        .await
        .unwrap();
        assert!(page.calls()[0].contains("Role"));
        assert!(page.calls()[0].contains("Go"));
    }
}

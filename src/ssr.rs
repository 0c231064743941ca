//! Detection of server-side-rendering state embedded in raw HTML, keyed by
//! framework signature. Parsers run in a fixed order and the first one that
//! yields valid JSON wins; malformed payloads are skipped, never errors.

use scraper::{Html, Selector};
use serde_json::Value;

#[derive(Clone, Debug)]
pub struct SsrData {
    pub framework: &'static str,
    pub data: Value,
}

/// Script-tag signatures read through the parsed document.
const SCRIPT_PARSERS: &[(&str, &str)] = &[
    ("next", "script#__NEXT_DATA__"),
    ("angular", "script#ng-state"),
    ("sveltekit", "script[data-sveltekit-fetched]"),
];

/// How a `window.<name>` assignment carries its state.
enum WindowValue {
    /// `window.<name> = {…}` object literal.
    Object(&'static str),
    /// `window.<name> = '…'` URL-encoded string literal (Nuxt 3).
    Quoted(&'static str),
}

/// `window.<name>` signatures read from the raw text, in precedence order.
const WINDOW_PARSERS: &[(&str, WindowValue)] = &[
    ("nuxt", WindowValue::Object("__NUXT__")),
    ("nuxt3", WindowValue::Quoted("__nuxt_state__")),
    ("gatsby", WindowValue::Object("___GATSBY")),
    ("remix", WindowValue::Object("__remixContext")),
    ("tanstack", WindowValue::Object("__TSR__")),
    ("vue", WindowValue::Object("__VUE_SSR_STATE__")),
    ("sveltekit-legacy", WindowValue::Object("__SVELTEKIT__")),
    ("generic", WindowValue::Object("__INITIAL_STATE__")),
    ("generic", WindowValue::Object("__APP_STATE__")),
    ("generic", WindowValue::Object("__REDUX_STATE__")),
    ("generic", WindowValue::Object("__STORE_STATE__")),
    ("generic", WindowValue::Object("__DATA__")),
    ("generic", WindowValue::Object("__STATE__")),
    ("generic", WindowValue::Object("__PROPS__")),
];

pub fn detect_ssr_data(html: &str) -> Option<SsrData> {
    let doc = Html::parse_document(html);
    detect_in_document(&doc, html)
}

/// Variant for callers that already parsed the document (the scraper tiers
/// share one DOM between SSR detection and content extraction).
pub fn detect_in_document(doc: &Html, raw: &str) -> Option<SsrData> {
    for (framework, css) in SCRIPT_PARSERS {
        let selector = match Selector::parse(css) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for script in doc.select(&selector) {
            let body: String = script.text().collect();
            if let Ok(data) = serde_json::from_str::<Value>(body.trim()) {
                return Some(SsrData { framework, data });
            }
        }
    }

    for (framework, signature) in WINDOW_PARSERS {
        let data = match signature {
            WindowValue::Object(name) => parse_object_assignment(raw, name),
            WindowValue::Quoted(name) => parse_quoted_assignment(raw, name),
        };
        if let Some(data) = data {
            return Some(SsrData { framework, data });
        }
    }
    None
}

/// Finds `window.<name> = { … }` and parses the balanced object literal.
fn parse_object_assignment(raw: &str, name: &str) -> Option<Value> {
    let needle = format!("window.{}", name);
    let mut search_from = 0;
    while let Some(offset) = raw[search_from..].find(&needle) {
        let after = search_from + offset + needle.len();
        let rest = raw[after..].trim_start();
        if let Some(body) = rest.strip_prefix('=') {
            let body = body.trim_start();
            if body.starts_with('{') {
                if let Some(object) = balanced_object(body) {
                    if let Ok(data) = serde_json::from_str::<Value>(object) {
                        return Some(data);
                    }
                }
            }
        }
        search_from = after;
    }
    None
}

/// Finds `window.<name> = '…'`, URL-decodes the literal, and parses it.
fn parse_quoted_assignment(raw: &str, name: &str) -> Option<Value> {
    let needle = format!("window.{}", name);
    let offset = raw.find(&needle)?;
    let rest = raw[offset + needle.len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = &rest[1..];
    let end = find_string_end(inner, quote)?;
    let decoded = percent_decode(&inner[..end]);
    serde_json::from_str(&decoded).ok()
}

/// Returns the `{…}` prefix of `s` with balanced braces, honoring string
/// literals and escapes.
fn balanced_object(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_string_end(s: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some(i);
        }
    }
    None
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_next_data_script() {
        let html = r#"<html><body>
            <script id="__NEXT_DATA__" type="application/json">{"props":{"page":1}}</script>
        </body></html>"#;
        let found = detect_ssr_data(html).unwrap();
        assert_eq!(found.framework, "next");
        assert_eq!(found.data["props"]["page"], 1);
    }

    #[test]
    fn detects_nuxt_window_assignment() {
        let html = r#"<script>window.__NUXT__ = {"state":{"items":[1,2]},"note":"a } in a string"};</script>"#;
        let found = detect_ssr_data(html).unwrap();
        assert_eq!(found.framework, "nuxt");
        assert_eq!(found.data["state"]["items"][1], 2);
    }

    #[test]
    fn detects_url_encoded_nuxt3_state() {
        let html = r#"<script>window.__nuxt_state__ = '%7B%22count%22%3A3%7D';</script>"#;
        let found = detect_ssr_data(html).unwrap();
        assert_eq!(found.framework, "nuxt3");
        assert_eq!(found.data["count"], 3);
    }

    #[test]
    fn nuxt2_wins_over_nuxt3_when_both_are_present() {
        let html = r#"<script>
            window.__NUXT__ = {"state":{"v":2}};
            window.__nuxt_state__ = '%7B%22v%22%3A3%7D';
        </script>"#;
        let found = detect_ssr_data(html).unwrap();
        assert_eq!(found.framework, "nuxt");
        assert_eq!(found.data["state"]["v"], 2);
    }

    #[test]
    fn falls_through_to_generic_state() {
        let html = r#"<script>window.__INITIAL_STATE__ = {"user":{"id":7}};</script>"#;
        let found = detect_ssr_data(html).unwrap();
        assert_eq!(found.framework, "generic");
        assert_eq!(found.data["user"]["id"], 7);
    }

    #[test]
    fn malformed_payloads_yield_none() {
        let html = r#"<html>
            <script id="__NEXT_DATA__">{not json</script>
            <script>window.__NUXT__ = {also: broken;</script>
        </html>"#;
        assert!(detect_ssr_data(html).is_none());
    }

    #[test]
    fn plain_pages_yield_none() {
        assert!(detect_ssr_data("<html><body><p>hello</p></body></html>").is_none());
    }
}

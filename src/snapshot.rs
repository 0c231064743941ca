//! Bounded, token-economical page views. Two builders share one shape: a
//! static pass over raw HTML and a live pass over an open page; both feed
//! the same renderer the model reads.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::driver::{LoadState, PageDriver};

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_TEXT_CHARS: usize = 3_500;
pub const MAX_LINKS: usize = 25;
pub const MAX_LINK_TEXT_CHARS: usize = 80;
pub const MAX_FORMS: usize = 5;
pub const MAX_FORM_INPUTS: usize = 10;
pub const MAX_AX_TREE_CHARS: usize = 3_000;
const MAX_RENDERED_URL_CHARS: usize = 150;

const SOCIAL_DOMAINS: &[&str] = &[
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "youtube.com",
    "tiktok.com",
    "t.me",
    "wa.me",
    "discord.gg",
    "github.com",
];

#[derive(Clone, Debug, Serialize)]
pub struct PageLink {
    pub text: String,
    pub href: String,
    pub index: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormInput {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub placeholder: String,
    pub selector: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PageForm {
    pub inputs: Vec<FormInput>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub text: String,
    pub links: Vec<PageLink>,
    pub forms: Vec<PageForm>,
    pub ax_tree: Option<String>,
    /// Base64 JPEG, attached by the loop when vision is active.
    pub screenshot: Option<String>,
}

impl PageSnapshot {
    pub fn minimal(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: url.to_string(),
            text: String::new(),
            links: Vec::new(),
            forms: Vec::new(),
            ax_tree: None,
            screenshot: None,
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn asset_ext_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.(png|jpe?g|gif|svg|ico|webp|css|js|woff2?|ttf|eot)$").unwrap())
}

/// Filter applied to anchors after URL resolution: fragment-only and
/// non-web schemes, static assets, empty anchor text, and the social
/// domains that never advance a task.
pub fn is_noise_link(raw_href: &str, text: &str, resolved: &Url) -> bool {
    if text.trim().is_empty() {
        return true;
    }
    if raw_href.trim().starts_with('#') {
        return true;
    }
    match resolved.scheme() {
        "http" | "https" => {}
        _ => return true,
    }
    if asset_ext_re().is_match(resolved.path()) {
        return true;
    }
    if let Some(host) = resolved.host_str() {
        let host = host.trim_start_matches("www.").to_lowercase();
        if SOCIAL_DOMAINS
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
        {
            return true;
        }
    }
    false
}

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn script_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>|<noscript\b[^>]*>.*?</noscript>",
        )
        .unwrap()
    })
}

/// Build a snapshot from raw HTML (no browser involved).
pub fn from_html(html: &str, base: &Url) -> PageSnapshot {
    let stripped = script_strip_re().replace_all(html, " ");
    let doc = Html::parse_document(&stripped);

    let title = doc
        .select(&sel("title"))
        .next()
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| base.to_string());

    let text = doc
        .select(&sel("body"))
        .next()
        .map(|body| collapse_ws(&body.text().collect::<String>()))
        .unwrap_or_default();

    let mut links = Vec::new();
    for anchor in doc.select(&sel("a[href]")) {
        if links.len() >= MAX_LINKS {
            break;
        }
        let raw_href = anchor.value().attr("href").unwrap_or_default();
        let text = collapse_ws(&anchor.text().collect::<String>());
        let resolved = match base.join(raw_href.trim()) {
            Ok(u) => u,
            Err(_) => continue,
        };
        if is_noise_link(raw_href, &text, &resolved) {
            continue;
        }
        links.push(PageLink {
            text: truncate_chars(&text, MAX_LINK_TEXT_CHARS),
            href: resolved.to_string(),
            index: links.len(),
        });
    }

    let mut forms = Vec::new();
    for form in doc.select(&sel("form")).take(MAX_FORMS) {
        let mut inputs = Vec::new();
        for input in form
            .select(&sel("input, textarea, select"))
            .take(MAX_FORM_INPUTS)
        {
            inputs.push(static_form_input(input));
        }
        forms.push(PageForm { inputs });
    }

    PageSnapshot {
        url: base.to_string(),
        title: truncate_chars(&title, MAX_TITLE_CHARS),
        text: truncate_chars(&text, MAX_TEXT_CHARS),
        links,
        forms,
        ax_tree: None,
        screenshot: None,
    }
}

fn static_form_input(el: ElementRef<'_>) -> FormInput {
    let tag = el.value().name().to_string();
    let id = el.value().attr("id").unwrap_or_default();
    let name = el.value().attr("name").unwrap_or_default();
    let selector = if !id.is_empty() {
        format!("#{}", id)
    } else if !name.is_empty() {
        format!("{}[name=\"{}\"]", tag, name)
    } else {
        tag.clone()
    };
    FormInput {
        name: if !name.is_empty() {
            name.to_string()
        } else {
            id.to_string()
        },
        kind: el
            .value()
            .attr("type")
            .map(str::to_string)
            .unwrap_or(tag),
        placeholder: el.value().attr("placeholder").unwrap_or_default().to_string(),
        selector,
    }
}

// ---- live mode ----

const LIVE_SNAPSHOT_JS: &str = r#"
(() => {
  const text = document.body ? document.body.innerText : '';
  const links = Array.from(document.querySelectorAll('a[href]')).slice(0, 200).map(a => ({
    text: (a.innerText || '').trim(),
    href: a.href,
  }));
  const forms = Array.from(document.querySelectorAll('form')).slice(0, 5).map(f => ({
    inputs: Array.from(f.querySelectorAll('input, textarea, select')).slice(0, 10).map(el => {
      const name = el.getAttribute('name') || '';
      const tag = el.tagName.toLowerCase();
      return {
        name: name || el.id || '',
        type: el.getAttribute('type') || tag,
        placeholder: el.getAttribute('placeholder') || '',
        selector: el.id ? '#' + el.id : (name ? tag + '[name="' + name + '"]' : tag),
      };
    }),
  }));
  return { text: text.slice(0, 8000), links, forms };
})()
"#;

#[derive(Deserialize)]
struct RawLiveSnapshot {
    #[serde(default)]
    text: String,
    #[serde(default)]
    links: Vec<RawLiveLink>,
    #[serde(default)]
    forms: Vec<PageForm>,
}

#[derive(Deserialize)]
struct RawLiveLink {
    #[serde(default)]
    text: String,
    #[serde(default)]
    href: String,
}

/// Build a snapshot from an open page. Never fails: if in-page evaluation
/// dies because a navigation destroyed the execution context, the builder
/// waits for the new document (bounded) and retries once; a second failure
/// yields a minimal snapshot so the loop can keep going.
pub async fn from_page(page: &dyn PageDriver, include_ax_tree: bool) -> PageSnapshot {
    let url = page.current_url().await;
    let title = match page.title().await {
        Ok(t) if !t.trim().is_empty() => t,
        _ => url.clone(),
    };

    let raw = match page.evaluate(LIVE_SNAPSHOT_JS).await {
        Ok(v) => Some(v),
        Err(_) => {
            let _ = page.wait_for_load(LoadState::DomContentLoaded, 5_000).await;
            page.evaluate(LIVE_SNAPSHOT_JS).await.ok()
        }
    };
    let raw: RawLiveSnapshot = match raw.and_then(|v| serde_json::from_value(v).ok()) {
        Some(r) => r,
        None => {
            let mut snap = PageSnapshot::minimal(&url);
            snap.title = truncate_chars(&title, MAX_TITLE_CHARS);
            return snap;
        }
    };

    let base = Url::parse(&url).ok();
    let mut links = Vec::new();
    for link in raw.links {
        if links.len() >= MAX_LINKS {
            break;
        }
        let resolved = match (&base, Url::parse(&link.href)) {
            (_, Ok(u)) => u,
            (Some(b), Err(_)) => match b.join(&link.href) {
                Ok(u) => u,
                Err(_) => continue,
            },
            (None, Err(_)) => continue,
        };
        let text = collapse_ws(&link.text);
        if is_noise_link(&link.href, &text, &resolved) {
            continue;
        }
        links.push(PageLink {
            text: truncate_chars(&text, MAX_LINK_TEXT_CHARS),
            href: resolved.to_string(),
            index: links.len(),
        });
    }

    let ax_tree = if include_ax_tree {
        match page.ax_tree().await {
            Ok(t) if !t.trim().is_empty() => Some(truncate_chars(&t, MAX_AX_TREE_CHARS)),
            _ => None,
        }
    } else {
        None
    };

    PageSnapshot {
        url,
        title: truncate_chars(&title, MAX_TITLE_CHARS),
        text: truncate_chars(&raw.text, MAX_TEXT_CHARS),
        links,
        forms: raw.forms.into_iter().take(MAX_FORMS).collect(),
        ax_tree,
        screenshot: None,
    }
}

// ---- rendering ----

fn shorten_url(raw: &str) -> String {
    if raw.chars().count() <= MAX_RENDERED_URL_CHARS {
        return raw.to_string();
    }
    match Url::parse(raw) {
        Ok(u) => {
            let mut out = format!("{}://{}{}", u.scheme(), u.host_str().unwrap_or_default(), u.path());
            if u.query().is_some() {
                out.push_str("?...");
            }
            out
        }
        Err(_) => truncate_chars(raw, MAX_RENDERED_URL_CHARS),
    }
}

impl PageSnapshot {
    /// Render the snapshot as the sectioned text block the model reads.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("## Current Page\n");
        out.push_str(&format!("URL: {}\n", shorten_url(&self.url)));
        out.push_str(&format!("Title: {}\n", self.title));

        out.push_str("\n### Page Text\n");
        out.push_str(if self.text.is_empty() { "(empty)" } else { &self.text });
        out.push('\n');

        out.push_str(&format!("\n### Links ({})\n", self.links.len()));
        for link in &self.links {
            out.push_str(&format!(
                "[{}] {} -> {}\n",
                link.index,
                link.text,
                shorten_url(&link.href)
            ));
        }

        out.push_str(&format!("\n### Forms ({})\n", self.forms.len()));
        for (i, form) in self.forms.iter().enumerate() {
            out.push_str(&format!("Form {}:\n", i + 1));
            for input in &form.inputs {
                out.push_str(&format!(
                    "  - {} ({}) placeholder=\"{}\" selector={}\n",
                    input.name, input.kind, input.placeholder, input.selector
                ));
            }
        }

        if let Some(tree) = &self.ax_tree {
            out.push_str("\n### Accessibility Tree\n");
            out.push_str(tree);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    #[test]
    fn static_snapshot_respects_bounds() {
        let mut links = String::new();
        for i in 0..60 {
            links.push_str(&format!("<a href=\"/l/{i}\">link {i}</a>"));
        }
        let body_text = "lorem ipsum ".repeat(600);
        let html = format!(
            "<html><head><title>T</title></head><body><p>{body_text}</p>{links}</body></html>"
        );
        let snap = from_html(&html, &base());
        assert_eq!(snap.links.len(), MAX_LINKS);
        assert!(snap.text.chars().count() <= MAX_TEXT_CHARS);
        let indices: Vec<usize> = snap.links.iter().map(|l| l.index).collect();
        assert_eq!(indices, (0..MAX_LINKS).collect::<Vec<_>>());
    }

    #[test]
    fn noise_links_are_dropped_and_indices_stay_dense() {
        let html = r##"<body>
            <a href="#top">top</a>
            <a href="javascript:void(0)">js</a>
            <a href="mailto:a@b.c">mail</a>
            <a href="/logo.png">logo</a>
            <a href="https://twitter.com/acme">tweet</a>
            <a href="https://www.facebook.com/acme">fb</a>
            <a href="/real">Real link</a>
            <a href="/empty"></a>
            <a href="/second">Second</a>
        </body>"##;
        let snap = from_html(html, &base());
        let hrefs: Vec<&str> = snap.links.iter().map(|l| l.href.as_str()).collect();
        assert_eq!(
            hrefs,
            vec!["https://example.com/real", "https://example.com/second"]
        );
        assert_eq!(snap.links[0].index, 0);
        assert_eq!(snap.links[1].index, 1);
    }

    #[test]
    fn asset_links_with_queries_are_noise() {
        let u = Url::parse("https://example.com/pic.jpeg?width=300").unwrap();
        assert!(is_noise_link("/pic.jpeg?width=300", "pic", &u));
    }

    #[test]
    fn forms_capture_selector_fallbacks() {
        let html = r#"<body><form>
            <input id="q" name="query" placeholder="Search">
            <input name="page">
            <textarea></textarea>
        </form></body>"#;
        let snap = from_html(html, &base());
        assert_eq!(snap.forms.len(), 1);
        let inputs = &snap.forms[0].inputs;
        assert_eq!(inputs[0].selector, "#q");
        assert_eq!(inputs[1].selector, "input[name=\"page\"]");
        assert_eq!(inputs[2].selector, "textarea");
        assert_eq!(inputs[2].kind, "textarea");
    }

    #[test]
    fn script_and_style_text_never_reach_the_body_text() {
        let html = "<body><script>var x = 'hidden';</script><style>.a{}</style><p>visible</p></body>";
        let snap = from_html(html, &base());
        assert_eq!(snap.text, "visible");
    }

    #[test]
    fn render_contains_all_sections() {
        let html = r#"<head><title>T</title></head><body><p>hello world</p>
            <a href="/x">X</a><form><input name="q"></form></body>"#;
        let rendered = from_html(html, &base()).render();
        assert!(rendered.contains("## Current Page"));
        assert!(rendered.contains("### Page Text"));
        assert!(rendered.contains("### Links (1)"));
        assert!(rendered.contains("### Forms (1)"));
    }

    #[test]
    fn long_urls_are_shortened_to_origin_and_path() {
        let long = format!("https://example.com/{}?q=1", "segment/".repeat(30));
        let short = shorten_url(&long);
        assert!(short.ends_with("?..."));
        assert!(short.len() < long.len());
        assert!(shorten_url("https://example.com/a").ends_with("/a"));
    }

    #[test]
    fn long_titles_are_truncated() {
        let html = format!("<head><title>{}</title></head><body></body>", "t".repeat(400));
        let snap = from_html(&html, &base());
        assert_eq!(snap.title.chars().count(), MAX_TITLE_CHARS);
    }
}

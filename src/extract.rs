//! Main-content extraction from raw HTML: a readability-style scoring pass
//! with a heuristic fallback, page metadata, absolute link harvesting, and
//! markdown/text emission. Also hosts the content-sufficiency check used by
//! the scraper cascade to decide tier escalation.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Minimum paragraph length that contributes to readability scoring.
const SCORE_CHAR_THRESHOLD: usize = 50;
/// A readability candidate below this much total text is rejected.
const READABILITY_MIN_TEXT: usize = 100;
/// A fallback candidate below this much text is skipped.
const CANDIDATE_MIN_TEXT: usize = 150;
/// Pages with less visible text than this never have enough content.
const MIN_CONTENT_CHARS: usize = 200;
/// Below this, anti-bot phrasing marks the page as a challenge shell.
const CHALLENGE_SUSPECT_CHARS: usize = 2_000;

const MAIN_CANDIDATES: &[&str] = &[
    "main",
    "article",
    "[role=\"main\"]",
    "#main-content",
    "#content",
    "#main",
    ".main-content",
    ".content",
    ".post-content",
    ".article-content",
    ".entry-content",
    ".page-content",
    ".blog-post",
    ".blog-content",
    ".post-body",
    ".article-body",
];

const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "svg", "nav", "header", "footer", "aside",
];

const NOISE_CLASS_HINTS: &[&str] = &[
    "sidebar",
    "advert",
    "-ads",
    "ads-",
    "cookie",
    "consent",
    "modal",
    "popup",
    "social-share",
    "share-button",
    "comment",
    "newsletter",
    "subscribe",
];

#[derive(Clone, Debug, Default)]
pub struct ExtractedContent {
    pub html: String,
    pub text: String,
    pub markdown: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub links: Vec<String>,
}

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(el, &mut out);
    collapse_ws(&out)
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    if is_noise_element(&el) {
        return;
    }
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            collect_text(child_el, out);
        }
    }
}

fn is_noise_element(el: &ElementRef<'_>) -> bool {
    let tag = el.value().name();
    if NOISE_TAGS.contains(&tag) {
        return true;
    }
    let mut hints = String::new();
    if let Some(class) = el.value().attr("class") {
        hints.push_str(&class.to_lowercase());
    }
    if let Some(id) = el.value().attr("id") {
        hints.push(' ');
        hints.push_str(&id.to_lowercase());
    }
    if hints.is_empty() {
        return false;
    }
    NOISE_CLASS_HINTS.iter().any(|h| hints.contains(h))
}

/// Extract the page's main content.
///
/// Strategy: a readability-style pass scores containers by the text mass of
/// their long paragraphs and takes the best one (rejected when the winner
/// carries under 100 chars of text); on rejection, the first main-content
/// candidate selector with more than 150 chars wins; failing both, the body
/// is used as-is. When `main_only` is false the body is always used.
pub fn extract(html: &str, main_only: bool, base: &Url) -> ExtractedContent {
    let doc = Html::parse_document(html);
    extract_from_document(&doc, main_only, base)
}

pub fn extract_from_document(doc: &Html, main_only: bool, base: &Url) -> ExtractedContent {
    let body = doc.select(&sel("body")).next();
    let container = if main_only {
        readability_candidate(doc)
            .or_else(|| fallback_candidate(doc))
            .or(body)
    } else {
        body
    };

    let (html_out, text, markdown) = match container {
        Some(el) => {
            let text = element_text(el);
            let markdown = to_markdown(el, base);
            (strip_noisy_attrs(&el.inner_html()), text, markdown)
        }
        None => (String::new(), String::new(), String::new()),
    };

    ExtractedContent {
        html: html_out,
        text,
        markdown,
        title: page_title(doc),
        description: page_description(doc),
        links: page_links(doc, base),
    }
}

fn readability_candidate(doc: &Html) -> Option<ElementRef<'_>> {
    let para = sel("p");
    let mut best: Option<(usize, ElementRef)> = None;
    for candidate in doc.select(&sel("article, main, section, div")) {
        let mut score = 0usize;
        for p in candidate.select(&para) {
            let len = element_text(p).chars().count();
            if len >= SCORE_CHAR_THRESHOLD {
                score += len;
            }
        }
        if score > 0 && best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, candidate));
        }
    }
    let (_, winner) = best?;
    if element_text(winner).chars().count() < READABILITY_MIN_TEXT {
        return None;
    }
    Some(winner)
}

fn fallback_candidate(doc: &Html) -> Option<ElementRef<'_>> {
    for css in MAIN_CANDIDATES {
        if let Ok(selector) = Selector::parse(css) {
            for candidate in doc.select(&selector) {
                if element_text(candidate).chars().count() > CANDIDATE_MIN_TEXT {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

fn strip_noisy_attrs(html: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"(?i)\s+(?:style|onclick|class)\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).unwrap()
    });
    re.replace_all(html, "").into_owned()
}

fn page_title(doc: &Html) -> Option<String> {
    if let Some(el) = doc.select(&sel("title")).next() {
        let t = collapse_ws(&el.text().collect::<String>());
        if !t.is_empty() {
            return Some(t);
        }
    }
    if let Some(el) = doc.select(&sel(r#"meta[property="og:title"]"#)).next() {
        if let Some(content) = el.value().attr("content") {
            let t = collapse_ws(content);
            if !t.is_empty() {
                return Some(t);
            }
        }
    }
    doc.select(&sel("h1")).next().and_then(|el| {
        let t = element_text(el);
        (!t.is_empty()).then_some(t)
    })
}

fn page_description(doc: &Html) -> Option<String> {
    for css in [
        r#"meta[name="description"]"#,
        r#"meta[property="og:description"]"#,
        r#"meta[name="twitter:description"]"#,
    ] {
        if let Some(el) = doc.select(&sel(css)).next() {
            if let Some(content) = el.value().attr("content") {
                let t = collapse_ws(content);
                if !t.is_empty() {
                    return Some(t);
                }
            }
        }
    }
    None
}

fn page_links(doc: &Html, base: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for anchor in doc.select(&sel("a[href]")) {
        let href = anchor.value().attr("href").unwrap_or_default().trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }
        if let Ok(abs) = base.join(href) {
            let s = abs.to_string();
            if seen.insert(s.clone()) {
                out.push(s);
            }
        }
    }
    out
}

// ---- markdown emission ----

fn to_markdown(el: ElementRef<'_>, base: &Url) -> String {
    let mut out = String::new();
    walk_markdown(el, base, &mut out);
    let squeezed = squeeze_blank_lines(&out);
    squeezed.trim().to_string()
}

fn walk_markdown(el: ElementRef<'_>, base: &Url, out: &mut String) {
    if is_noise_element(&el) {
        return;
    }
    let tag = el.value().name();
    match tag {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag.as_bytes()[1] - b'0';
            let text = element_text(el);
            if !text.is_empty() {
                out.push_str("\n\n");
                out.push_str(&"#".repeat(level as usize));
                out.push(' ');
                out.push_str(&text);
                out.push('\n');
            }
        }
        "p" => {
            out.push_str("\n\n");
            walk_children(el, base, out);
            out.push('\n');
        }
        "br" => out.push('\n'),
        "a" => {
            let text = element_text(el);
            let href = el.value().attr("href").unwrap_or_default();
            match base.join(href) {
                Ok(abs) if !text.is_empty() => {
                    out.push_str(&format!("[{}]({})", text, abs));
                }
                _ => out.push_str(&text),
            }
        }
        "strong" | "b" => {
            let text = element_text(el);
            if !text.is_empty() {
                out.push_str(&format!("**{}**", text));
            }
        }
        "em" | "i" => {
            let text = element_text(el);
            if !text.is_empty() {
                out.push_str(&format!("*{}*", text));
            }
        }
        "code" => {
            let text = element_text(el);
            if !text.is_empty() {
                out.push_str(&format!("`{}`", text));
            }
        }
        "pre" => {
            let raw: String = el.text().collect();
            out.push_str("\n\n```\n");
            out.push_str(raw.trim_end());
            out.push_str("\n```\n");
        }
        "li" => {
            out.push_str("\n- ");
            walk_children(el, base, out);
        }
        "blockquote" => {
            let text = element_text(el);
            if !text.is_empty() {
                out.push_str(&format!("\n\n> {}\n", text));
            }
        }
        "img" => {}
        _ => walk_children(el, base, out),
    }
}

fn walk_children(el: ElementRef<'_>, base: &Url, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            let t = collapse_ws(text);
            if !t.is_empty() {
                if !out.ends_with(|c: char| c.is_whitespace() || c == '(') && !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&t);
            }
        } else if let Some(child_el) = ElementRef::wrap(child) {
            walk_markdown(child_el, base, out);
        }
    }
}

fn squeeze_blank_lines(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    re.replace_all(s, "\n\n").into_owned()
}

// ---- content sufficiency ----

fn tag_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>|<noscript\b[^>]*>.*?</noscript>|<iframe\b[^>]*>.*?</iframe>|<svg\b[^>]*>.*?</svg>|<[^>]+>",
        )
        .unwrap()
    })
}

fn challenge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)just a moment|checking your browser|ray id|ddos-guard|incapsula|imperva|datadome|captcha|verify you are human|are you a robot|enable javascript|access denied|bot detected",
        )
        .unwrap()
    })
}

/// Whether raw HTML carries real content rather than an empty shell or an
/// anti-bot challenge page. Works on its own copy of the text, so callers
/// may keep a shared parsed DOM untouched.
pub fn has_enough_content(html: &str) -> bool {
    let text = collapse_ws(&tag_strip_re().replace_all(html, " "));
    let len = text.chars().count();
    if len < MIN_CONTENT_CHARS {
        return false;
    }
    if len < CHALLENGE_SUSPECT_CHARS && challenge_re().is_match(&text) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/news/").unwrap()
    }

    fn article_html() -> String {
        let long_para = "The observatory confirmed the event this morning. ".repeat(8);
        format!(
            r#"<html><head>
                <title>News — Daily</title>
                <meta name="description" content="Daily space weather report">
            </head><body>
                <nav><a href="/home">Home</a><a href="/about">About</a></nav>
                <article>
                    <h1>Solar flare observed</h1>
                    <p>{long_para}</p>
                    <p>Read the <a href="/story/1">full story</a>.</p>
                </article>
                <footer>© Daily</footer>
            </body></html>"#
        )
    }

    #[test]
    fn extracts_main_article_and_drops_chrome() {
        let out = extract(&article_html(), true, &base());
        assert!(out.text.contains("Solar flare observed"));
        assert!(out.text.contains("observatory confirmed"));
        assert!(!out.text.contains("© Daily"));
        assert!(!out.text.contains("About"));
        assert_eq!(out.title.as_deref(), Some("News — Daily"));
        assert_eq!(out.description.as_deref(), Some("Daily space weather report"));
    }

    #[test]
    fn markdown_carries_headings_and_absolute_links() {
        let out = extract(&article_html(), true, &base());
        assert!(out.markdown.contains("# Solar flare observed"));
        assert!(out.markdown.contains("(https://example.com/story/1)"));
    }

    #[test]
    fn links_are_absolute_and_deduplicated() {
        let html = r##"<body>
            <a href="/a">one</a><a href="/a">dup</a>
            <a href="#top">anchor</a><a href="mailto:x@y.z">mail</a>
            <a href="tel:123">tel</a><a href="javascript:void(0)">js</a>
        </body>"##;
        let out = extract(html, false, &base());
        assert_eq!(out.links, vec!["https://example.com/a".to_string()]);
    }

    #[test]
    fn title_falls_back_to_og_then_h1() {
        let html = r#"<head><meta property="og:title" content="OG Title"></head><body><h1>H1</h1></body>"#;
        assert_eq!(extract(html, false, &base()).title.as_deref(), Some("OG Title"));
        let html = "<body><h1>Only Heading</h1></body>";
        assert_eq!(extract(html, false, &base()).title.as_deref(), Some("Only Heading"));
    }

    #[test]
    fn noisy_attrs_are_stripped_from_html_output() {
        let long = "content ".repeat(40);
        let html = format!(
            r#"<body><article><p style="color:red" class="lead" onclick="x()">{long}</p></article></body>"#
        );
        let out = extract(&html, true, &base());
        assert!(!out.html.contains("style="));
        assert!(!out.html.contains("onclick="));
        assert!(!out.html.contains("class="));
    }

    #[test]
    fn short_pages_do_not_have_enough_content() {
        assert!(!has_enough_content("<html><body><p>tiny</p></body></html>"));
    }

    #[test]
    fn challenge_pages_do_not_have_enough_content() {
        let filler = "word ".repeat(60);
        let html = format!(
            "<html><body><p>Just a moment... Checking your browser. {filler}</p></body></html>"
        );
        assert!(!has_enough_content(&html));
    }

    #[test]
    fn long_real_pages_have_enough_content() {
        let filler = "A perfectly ordinary sentence about the weather. ".repeat(60);
        let html = format!("<html><body><p>{filler}</p></body></html>");
        assert!(has_enough_content(&html));
        // Long pages keep their content even when the word captcha appears.
        let html = format!("<html><body><p>{filler} captcha {filler}</p></body></html>");
        assert!(has_enough_content(&html));
    }

    #[test]
    fn script_text_is_invisible_to_the_sufficiency_check() {
        let script = "var filler = 'x'; ".repeat(200);
        let html = format!("<html><body><script>{script}</script><p>tiny</p></body></html>");
        assert!(!has_enough_content(&html));
    }
}

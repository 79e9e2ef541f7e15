//! Allow-list HTML sanitizer.
//!
//! Rendered notification HTML is injected into customer sites, so the
//! surface is strict: a fixed allow-list of tags and attributes, no event
//! handlers, no scriptable URLs. [`validate`] reports dangerous patterns
//! for template validation; [`sanitize`] strips them from rendered output.
//! No external parser: notification markup is small and flat, and the
//! tokenizer below covers exactly what the allow-list needs.

use std::collections::HashSet;
use std::sync::OnceLock;

const ALLOWED_TAGS: &[&str] = &[
    "a", "b", "br", "div", "em", "h1", "h2", "h3", "h4", "h5", "h6", "i", "img", "li", "ol", "p",
    "small", "span", "strong", "u", "ul",
];

/// Attributes allowed on any tag.
const GLOBAL_ATTRS: &[&str] = &["class", "id", "style", "title"];

/// Tag-specific attributes on top of the global set.
fn tag_attrs(tag: &str) -> &'static [&'static str] {
    match tag {
        "a" => &["href", "target", "rel"],
        "img" => &["src", "alt", "width", "height"],
        _ => &[],
    }
}

/// Tags whose entire content is dropped when encountered.
const SWALLOWED_TAGS: &[&str] = &["iframe", "noscript", "object", "script", "style", "embed"];

fn allowed_tags() -> &'static HashSet<&'static str> {
    static TAGS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    TAGS.get_or_init(|| ALLOWED_TAGS.iter().copied().collect())
}

/// Scan template or rendered HTML for dangerous patterns.
///
/// Returns one message per finding; an empty vector means the input is
/// clean. Used by template validation, where dangerous input is rejected
/// rather than silently stripped.
#[must_use]
pub fn validate(html: &str) -> Vec<String> {
    let lower = html.to_lowercase();
    let mut errors = Vec::new();

    for tag in SWALLOWED_TAGS {
        if lower.contains(&format!("<{tag}")) {
            errors.push(format!("forbidden <{tag}> element"));
        }
    }
    if lower.contains("javascript:") {
        errors.push("javascript: URL".to_string());
    }
    if lower.contains("data:text/html") {
        errors.push("data:text/html URL".to_string());
    }
    if has_event_handler(&lower) {
        errors.push("inline event handler attribute".to_string());
    }

    errors
}

/// Detect ` on<word>=` attribute shapes inside tag contexts.
fn has_event_handler(lower: &str) -> bool {
    let bytes = lower.as_bytes();
    let mut in_tag = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => in_tag = true,
            b'>' => in_tag = false,
            b'o' if in_tag && i > 0 && bytes[i - 1].is_ascii_whitespace() => {
                if bytes.get(i + 1) == Some(&b'n') {
                    let rest = &bytes[i + 2..];
                    let name_len = rest
                        .iter()
                        .take_while(|b| b.is_ascii_alphabetic())
                        .count();
                    if name_len > 0 && rest.get(name_len) == Some(&b'=') {
                        return true;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// Strip everything outside the allow-list from rendered HTML.
///
/// Disallowed tags lose their markup but keep their inner text, except the
/// swallowed set (`<script>`, `<style>`, …) whose content is dropped
/// entirely. Event-handler attributes and scriptable URLs never survive.
#[must_use]
pub fn sanitize(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];

        if rest.starts_with("<!--") {
            // Comments are dropped whole.
            rest = rest.find("-->").map_or("", |end| &rest[end + 3..]);
            continue;
        }

        let Some(end) = rest.find('>') else {
            // Unterminated tag: drop the remainder.
            break;
        };
        let raw_tag = &rest[1..end];
        rest = &rest[end + 1..];

        let (closing, body) = match raw_tag.strip_prefix('/') {
            Some(body) => (true, body),
            None => (false, raw_tag),
        };
        let name: String = body
            .chars()
            .take_while(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_lowercase();

        if name.is_empty() {
            continue;
        }

        if SWALLOWED_TAGS.contains(&name.as_str()) {
            if !closing {
                // Drop content up to (and including) the matching close.
                let close = format!("</{name}");
                if let Some(pos) = rest.to_lowercase().find(&close) {
                    let after = &rest[pos..];
                    rest = after.find('>').map_or("", |gt| &after[gt + 1..]);
                } else {
                    rest = "";
                }
            }
            continue;
        }

        if !allowed_tags().contains(name.as_str()) {
            // Keep inner content, lose the markup.
            continue;
        }

        if closing {
            out.push_str(&format!("</{name}>"));
        } else {
            let self_closing = body.trim_end().ends_with('/');
            out.push_str(&rebuild_tag(&name, body, self_closing));
        }
    }

    out.push_str(rest);
    out
}

fn rebuild_tag(name: &str, body: &str, self_closing: bool) -> String {
    let mut tag = format!("<{name}");
    for (attr, value) in parse_attrs(&body[name.len()..]) {
        if !attr_allowed(name, &attr) {
            continue;
        }
        match value {
            Some(value) if url_attr(&attr) && dangerous_url(&value) => {}
            Some(value) => {
                tag.push_str(&format!(" {attr}=\"{}\"", value.replace('"', "&quot;")));
            }
            None => {
                tag.push(' ');
                tag.push_str(&attr);
            }
        }
    }
    if self_closing {
        tag.push_str(" /");
    }
    tag.push('>');
    tag
}

fn attr_allowed(tag: &str, attr: &str) -> bool {
    if attr.starts_with("on") {
        return false;
    }
    GLOBAL_ATTRS.contains(&attr) || tag_attrs(tag).contains(&attr)
}

fn url_attr(attr: &str) -> bool {
    attr == "href" || attr == "src"
}

fn dangerous_url(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_lowercase();
    normalized.starts_with("javascript:") || normalized.starts_with("data:text/html")
}

/// Parse `key`, `key=value`, `key="value"`, `key='value'` attribute lists.
fn parse_attrs(input: &str) -> Vec<(String, Option<String>)> {
    let mut attrs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let name: String = {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    name.push(c.to_ascii_lowercase());
                    chars.next();
                } else {
                    break;
                }
            }
            name
        };
        if name.is_empty() {
            if chars.next().is_none() {
                break;
            }
            continue;
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek() != Some(&'=') {
            attrs.push((name, None));
            continue;
        }
        chars.next();
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let value = match chars.peek() {
            Some(&quote @ ('"' | '\'')) => {
                chars.next();
                let mut value = String::new();
                for c in chars.by_ref() {
                    if c == quote {
                        break;
                    }
                    value.push(c);
                }
                value
            }
            _ => {
                let mut value = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '/' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value
            }
        };
        attrs.push((name, Some(value)));
    }

    attrs
}

/// Derive a plain-text body from HTML: strip tags, decode the handful of
/// entities templates actually use, collapse whitespace.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        rest = &rest[start..];
        match rest.find('>') {
            Some(end) => {
                // Block-ish boundaries become spaces so words don't fuse.
                text.push(' ');
                rest = &rest[end + 1..];
            }
            None => {
                rest = "";
            }
        }
    }
    text.push_str(rest);

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_flags_script_and_handlers() {
        let errors = validate(r#"<div onclick="steal()"><script>x()</script></div>"#);
        assert!(errors.iter().any(|e| e.contains("<script>")));
        assert!(errors.iter().any(|e| e.contains("event handler")));
    }

    #[test]
    fn validate_flags_javascript_urls() {
        let errors = validate(r#"<a href="javascript:alert(1)">x</a>"#);
        assert_eq!(errors, vec!["javascript: URL"]);
    }

    #[test]
    fn validate_passes_clean_markup() {
        assert!(validate(r#"<div class="toast"><strong>Ana</strong> bought a Mug</div>"#)
            .is_empty());
    }

    #[test]
    fn sanitize_drops_script_with_content() {
        let out = sanitize(r#"<p>hi</p><script>alert(1)</script><p>bye</p>"#);
        assert_eq!(out, "<p>hi</p><p>bye</p>");
    }

    #[test]
    fn sanitize_strips_event_handlers_but_keeps_tag() {
        let out = sanitize(r#"<div class="x" onclick="evil()">ok</div>"#);
        assert_eq!(out, r#"<div class="x">ok</div>"#);
    }

    #[test]
    fn sanitize_removes_javascript_hrefs() {
        let out = sanitize(r#"<a href="javascript:alert(1)" class="x">link</a>"#);
        assert_eq!(out, r#"<a class="x">link</a>"#);
    }

    #[test]
    fn sanitize_keeps_safe_links_and_images() {
        let input = r#"<a href="https://shop.example" rel="noopener">see</a><img src="/mug.png" alt="Mug">"#;
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn unknown_tags_lose_markup_but_keep_text() {
        assert_eq!(sanitize("<marquee>sale</marquee>"), "sale");
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(sanitize("a<!-- hidden -->b"), "ab");
    }

    #[test]
    fn obfuscated_javascript_url_is_caught() {
        let out = sanitize("<a href=\"java\nscript:alert(1)\">x</a>");
        assert_eq!(out, "<a>x</a>");
    }

    #[test]
    fn html_to_text_strips_and_collapses() {
        let text = html_to_text("<div><strong>Ana</strong> bought\n   a <em>Mug</em>&nbsp;today</div>");
        assert_eq!(text, "Ana bought a Mug today");
    }
}

//! Main-text extraction from fetched HTML
//!
//! A single-pass tag scanner: drops script/style/nav/noscript subtrees,
//! flattens the rest to whitespace-normalized text, captures the title,
//! the `<link rel="canonical">` hint, and up to 100 outgoing links for
//! the link graph. Plain-text bodies pass through with normalization
//! only.

use url::Url;

/// Out-links counted per page (authority abuse bound)
pub const MAX_OUT_LINKS: usize = 100;

/// Extraction result for one page
#[derive(Debug, Clone, Default)]
pub struct ExtractedContent {
    pub title: String,
    pub text: String,
    pub canonical_hint: Option<String>,
    pub out_links: Vec<String>,
}

impl ExtractedContent {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Elements whose entire subtree is skipped.
/// `head` is walked (title and canonical link live there); its
/// script/style children are skipped individually.
fn is_skipped_element(tag: &str) -> bool {
    matches!(
        tag,
        "script" | "style" | "noscript" | "template" | "svg" | "iframe"
    )
}

/// Elements that force a word break around their boundaries
fn is_block_element(tag: &str) -> bool {
    matches!(
        tag,
        "p" | "div"
            | "br"
            | "li"
            | "ul"
            | "ol"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "tr"
            | "td"
            | "th"
            | "table"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "blockquote"
            | "pre"
    )
}

/// Extract text and structure from an HTML or plain-text body
pub fn extract(body: &str, content_type: &str, base_url: &Url) -> ExtractedContent {
    if content_type.starts_with("text/plain") || content_type.starts_with("text/markdown") {
        return ExtractedContent {
            title: String::new(),
            text: normalize_whitespace(body),
            canonical_hint: None,
            out_links: Vec::new(),
        };
    }
    extract_html(body, base_url)
}

fn extract_html(html: &str, base_url: &Url) -> ExtractedContent {
    let mut out = ExtractedContent::default();
    let mut text = String::new();
    let mut rest = html;
    let mut skip_until: Option<String> = None;
    let mut in_title = false;

    while let Some(lt) = rest.find('<') {
        let before = &rest[..lt];
        if skip_until.is_none() {
            if in_title {
                out.title.push_str(before);
            } else {
                text.push_str(&decode_entities(before));
            }
        }
        rest = &rest[lt + 1..];

        // Comments
        if let Some(after) = rest.strip_prefix("!--") {
            rest = match after.find("-->") {
                Some(end) => &after[end + 3..],
                None => "",
            };
            continue;
        }

        let Some(gt) = rest.find('>') else {
            break;
        };
        let raw_tag = &rest[..gt];
        rest = &rest[gt + 1..];

        let closing = raw_tag.starts_with('/');
        let tag_body = raw_tag.trim_start_matches('/');
        let name: String = tag_body
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }

        if let Some(until) = &skip_until {
            if closing && name == *until {
                skip_until = None;
            }
            continue;
        }

        if closing {
            if name == "title" {
                in_title = false;
            }
            if is_block_element(&name) {
                text.push(' ');
            }
            continue;
        }

        let self_closing = tag_body.trim_end().ends_with('/');

        match name.as_str() {
            "title" => in_title = true,
            "link" => {
                if attr_value(tag_body, "rel").as_deref() == Some("canonical") {
                    if let Some(href) = attr_value(tag_body, "href") {
                        if let Ok(resolved) = base_url.join(&href) {
                            out.canonical_hint = Some(resolved.to_string());
                        }
                    }
                }
            }
            "a" => {
                if out.out_links.len() < MAX_OUT_LINKS {
                    if let Some(href) = attr_value(tag_body, "href") {
                        if let Ok(resolved) = base_url.join(&href) {
                            let scheme = resolved.scheme();
                            if scheme == "http" || scheme == "https" {
                                out.out_links.push(resolved.to_string());
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        if is_skipped_element(&name) && !self_closing {
            skip_until = Some(name.clone());
        }
        if is_block_element(&name) {
            text.push(' ');
        }
    }

    if skip_until.is_none() && !rest.is_empty() {
        text.push_str(&decode_entities(rest));
    }

    out.title = normalize_whitespace(&decode_entities(&out.title));
    out.text = normalize_whitespace(&text);
    out
}

/// Pull a quoted attribute value out of a raw tag body
fn attr_value(tag_body: &str, attr: &str) -> Option<String> {
    let lower = tag_body.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find(attr) {
        let at = search_from + pos;
        // Must be a standalone attribute name
        let before_ok = at == 0
            || lower[..at]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_whitespace());
        let after = &tag_body[at + attr.len()..];
        let after_trim = after.trim_start();
        if before_ok && after_trim.starts_with('=') {
            let value_part = after_trim[1..].trim_start();
            let quote = value_part.chars().next()?;
            if quote == '"' || quote == '\'' {
                let inner = &value_part[1..];
                return inner.find(quote).map(|end| inner[..end].to_string());
            }
            // Unquoted value: read to whitespace
            let end = value_part
                .find(|c: char| c.is_whitespace() || c == '>')
                .unwrap_or(value_part.len());
            return Some(value_part[..end].to_string());
        }
        search_from = at + attr.len();
    }
    None
}

/// Minimal entity decoding for the common few
fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Collapse runs of whitespace to single spaces and trim
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.org/dir/page").unwrap()
    }

    #[test]
    fn test_basic_extraction() {
        let html = "<html><head><title>My Page</title></head>\
                    <body><p>Hello <b>world</b>.</p></body></html>";
        let out = extract(html, "text/html", &base());
        assert_eq!(out.title, "My Page");
        assert_eq!(out.text, "Hello world.");
    }

    #[test]
    fn test_scripts_and_styles_dropped() {
        let html = "<body><script>var x = 'junk';</script>\
                    <style>.a { color: red }</style><p>Visible</p></body>";
        let out = extract(html, "text/html", &base());
        assert_eq!(out.text, "Visible");
    }

    #[test]
    fn test_links_resolved_and_capped() {
        let mut html = String::from("<body>");
        for i in 0..150 {
            html.push_str(&format!("<a href=\"/page{i}\">x</a>"));
        }
        html.push_str("</body>");
        let out = extract(&html, "text/html", &base());
        assert_eq!(out.out_links.len(), MAX_OUT_LINKS);
        assert_eq!(out.out_links[0], "https://example.org/page0");
    }

    #[test]
    fn test_canonical_hint_captured() {
        let html = "<head><link rel=\"canonical\" href=\"/canonical-path\"></head>";
        let out = extract(html, "text/html", &base());
        assert_eq!(
            out.canonical_hint.as_deref(),
            Some("https://example.org/canonical-path")
        );
    }

    #[test]
    fn test_non_http_links_skipped() {
        let html = "<a href=\"mailto:x@example.org\">m</a><a href=\"javascript:void(0)\">j</a>\
                    <a href=\"https://example.org/ok\">ok</a>";
        let out = extract(html, "text/html", &base());
        assert_eq!(out.out_links, vec!["https://example.org/ok"]);
    }

    #[test]
    fn test_plain_text_passthrough() {
        let out = extract("hello   \n\n world", "text/plain", &base());
        assert_eq!(out.text, "hello world");
        assert!(out.out_links.is_empty());
    }

    #[test]
    fn test_entities_decoded() {
        let out = extract("<p>a &amp; b &lt;c&gt;</p>", "text/html", &base());
        assert_eq!(out.text, "a & b <c>");
    }

    #[test]
    fn test_empty_body_is_empty() {
        let out = extract("<script>only junk</script>", "text/html", &base());
        assert!(out.is_empty());
    }

    #[test]
    fn test_comments_skipped() {
        let out = extract("<p>a</p><!-- hidden --><p>b</p>", "text/html", &base());
        assert_eq!(out.text, "a b");
    }
}

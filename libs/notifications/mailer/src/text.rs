//! Plain-text rendering of HTML bodies.
//!
//! When a message carries only an HTML body, a text alternative is
//! derived from it so plain-text clients still get something readable.

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6",
    "ul", "ol", "table", "blockquote", "pre", "hr",
];

/// Converts an HTML fragment to readable plain text.
///
/// Block elements become line breaks, links keep their target in
/// parentheses unless the link text is the target itself, images are
/// dropped, and style/script contents are skipped entirely.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.char_indices().peekable();
    let mut skip_until: Option<&'static str> = None;
    let mut pending_href: Option<String> = None;
    let mut link_text = String::new();
    let mut in_link = false;

    while let Some((idx, ch)) = chars.next() {
        if ch != '<' {
            if skip_until.is_none() {
                if in_link {
                    link_text.push(ch);
                } else {
                    out.push(ch);
                }
            }
            continue;
        }

        // Find the end of the tag.
        let rest = &html[idx + 1..];
        let Some(end) = rest.find('>') else {
            break;
        };
        let tag_body = &rest[..end];
        let tag_end = idx + 1 + end;
        while let Some(&(next_idx, _)) = chars.peek() {
            if next_idx > tag_end {
                break;
            }
            chars.next();
        }

        let (name, is_closing) = tag_name(tag_body);

        if let Some(waiting_for) = skip_until {
            if is_closing && name == waiting_for {
                skip_until = None;
            }
            continue;
        }

        match (name.as_str(), is_closing) {
            ("style", false) => skip_until = Some("style"),
            ("script", false) => skip_until = Some("script"),
            ("a", false) => {
                in_link = true;
                link_text.clear();
                pending_href = attribute(tag_body, "href");
            }
            ("a", true) => {
                in_link = false;
                let text = link_text.trim().to_string();
                out.push_str(&text);
                if let Some(href) = pending_href.take() {
                    if !href.is_empty() && href != text {
                        out.push_str(&format!(" ({href})"));
                    }
                }
            }
            ("img", _) => {}
            (tag, _) if BLOCK_TAGS.contains(&tag) => {
                if in_link {
                    link_text.push('\n');
                } else {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }

    collapse(&decode_entities(&out))
}

fn tag_name(tag_body: &str) -> (String, bool) {
    let trimmed = tag_body.trim();
    let is_closing = trimmed.starts_with('/');
    let trimmed = trimmed.trim_start_matches('/');
    let name: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    (name, is_closing)
}

fn attribute(tag_body: &str, name: &str) -> Option<String> {
    let lower = tag_body.to_ascii_lowercase();
    let marker = format!("{name}=");
    let start = lower.find(&marker)? + marker.len();
    let rest = &tag_body[start..];
    let mut chars = rest.chars();
    match chars.next()? {
        quote @ ('"' | '\'') => {
            let inner: String = chars.take_while(|&c| c != quote).collect();
            Some(inner)
        }
        first => {
            let mut value = String::new();
            value.push(first);
            value.extend(chars.take_while(|c| !c.is_whitespace() && *c != '>'));
            Some(value)
        }
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Trims trailing space per line and collapses runs of blank lines.
fn collapse(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_are_separated_by_a_blank_line() {
        let text = html_to_text("<p>first</p><p>second</p>");
        assert_eq!(text, "first\n\nsecond");
    }

    #[test]
    fn links_keep_their_target() {
        let text = html_to_text(r#"<a href="https://example.com">click here</a>"#);
        assert_eq!(text, "click here (https://example.com)");
    }

    #[test]
    fn self_describing_links_are_not_doubled() {
        let text = html_to_text(r#"<a href="https://example.com">https://example.com</a>"#);
        assert_eq!(text, "https://example.com");
    }

    #[test]
    fn images_are_dropped() {
        let text = html_to_text(r#"before <img src="x.png" alt="logo"> after"#);
        assert_eq!(text, "before  after");
    }

    #[test]
    fn style_and_script_contents_are_skipped() {
        let text = html_to_text("<style>p { color: red; }</style><p>visible</p><script>alert(1)</script>");
        assert_eq!(text, "visible");
    }

    #[test]
    fn entities_are_decoded() {
        let text = html_to_text("fish &amp; chips &lt;hot&gt;&nbsp;&quot;now&quot;");
        assert_eq!(text, "fish & chips <hot> \"now\"");
    }

    #[test]
    fn blank_lines_collapse() {
        let text = html_to_text("<div>a</div><br><br><br><div>b</div>");
        assert_eq!(text, "a\n\nb");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(html_to_text("no markup here"), "no markup here");
    }
}

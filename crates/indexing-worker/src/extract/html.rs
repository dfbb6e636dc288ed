use scraper::Html;

/// Tags whose text content is never useful in an indexed document.
const SKIP_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Strip markup and return readable text. Tolerant of broken fragments;
/// anything scraper cannot make sense of comes back as-is.
pub fn strip_html(raw: &str) -> String {
    if !raw.contains('<') {
        return normalize_whitespace(raw);
    }

    let fragment = Html::parse_fragment(raw);
    let mut out = String::new();

    for node in fragment.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let in_skipped = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| SKIP_TAGS.contains(&e.name()))
                    .unwrap_or(false)
            });
            if !in_skipped {
                out.push_str(text);
                out.push(' ');
            }
        }
    }

    normalize_whitespace(&out)
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_tags_and_collapses_whitespace() {
        let html = "<p>Hello  <b>world</b></p>\n<p>again</p>";
        assert_eq!(strip_html(html), "Hello world again");
    }

    #[test]
    fn test_script_content_dropped() {
        let html = "<div>keep</div><script>var x = 1;</script>";
        assert_eq!(strip_html(html), "keep");
    }

    #[test]
    fn test_plain_text_passthrough() {
        assert_eq!(strip_html("no markup   here"), "no markup here");
    }
}

//! Indexation-status extraction (§4.7): classifies a rendered page as
//! `1` indexable, `2` non-200, `3` blocked-by-meta, or `4` non-canonical,
//! by inspecting meta-robots, `X-Robots-Tag`, and canonical-link
//! resolution against the final URL.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

fn meta_robots_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<meta\b[^>]*\bname\s*=\s*["']robots["'][^>]*\bcontent\s*=\s*["']([^"']*)["'][^>]*>"#)
            .expect("static regex")
    })
}

fn canonical_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<link\b[^>]*\brel\s*=\s*["']canonical["'][^>]*\bhref\s*=\s*["']([^"']*)["'][^>]*>"#)
            .expect("static regex")
    })
}

fn directives_block(content: &str) -> bool {
    content.split(',').map(str::trim).any(|d| d.eq_ignore_ascii_case("noindex"))
}

fn header_blocks(headers: &HashMap<String, Vec<String>>) -> bool {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("x-robots-tag"))
        .map(|(_, values)| values.iter().any(|v| directives_block(v)))
        .unwrap_or(false)
}

fn meta_blocks(html: &str) -> bool {
    meta_robots_re().captures(html).map(|c| directives_block(c.get(1).unwrap().as_str())).unwrap_or(false)
}

fn canonical_mismatch(html: &str, final_url: &str) -> bool {
    let Some(href) = canonical_link_re().captures(html).map(|c| c.get(1).unwrap().as_str()) else {
        return false;
    };
    let Ok(base) = url::Url::parse(final_url) else {
        return false;
    };
    let Ok(resolved) = base.join(href) else {
        return false;
    };
    resolved.as_str() != base.as_str()
}

/// `1` indexable, `2` non-200, `3` blocked-by-meta, `4` non-canonical (§4.7).
/// Checked in that priority order: a non-200 status always wins, then a
/// meta/header noindex directive, then canonical mismatch.
pub fn classify(status: u16, html: &str, headers: &HashMap<String, Vec<String>>, final_url: &str) -> u8 {
    if status != 200 {
        return 2;
    }
    if meta_blocks(html) || header_blocks(headers) {
        return 3;
    }
    if canonical_mismatch(html, final_url) {
        return 4;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_200_status_is_always_two() {
        assert_eq!(classify(404, "<html></html>", &HashMap::new(), "https://x/"), 2);
    }

    #[test]
    fn meta_noindex_blocks() {
        let html = r#"<meta name="robots" content="noindex, follow">"#;
        assert_eq!(classify(200, html, &HashMap::new(), "https://x/"), 3);
    }

    #[test]
    fn header_noindex_blocks() {
        let mut headers = HashMap::new();
        headers.insert("X-Robots-Tag".to_string(), vec!["noindex".to_string()]);
        assert_eq!(classify(200, "<html></html>", &headers, "https://x/"), 3);
    }

    #[test]
    fn mismatched_canonical_is_four() {
        let html = r#"<link rel="canonical" href="https://x/other">"#;
        assert_eq!(classify(200, html, &HashMap::new(), "https://x/page"), 4);
    }

    #[test]
    fn matching_canonical_is_indexable() {
        let html = r#"<link rel="canonical" href="https://x/page">"#;
        assert_eq!(classify(200, html, &HashMap::new(), "https://x/page"), 1);
    }

    #[test]
    fn no_directives_is_indexable() {
        assert_eq!(classify(200, "<html></html>", &HashMap::new(), "https://x/"), 1);
    }
}

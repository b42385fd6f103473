//! Script-cleaning pass applied to a rendered document before it's cached
//! (§4.7): removes executable `<script>` elements and script-preload
//! `<link>`s, while preserving the data-carrying script types and
//! stylesheet/canonical links a page may depend on.

use regex::Regex;
use std::sync::OnceLock;

/// `<script type="...">` values that carry data rather than executable
/// code and must survive cleaning (§4.7).
const PRESERVED_SCRIPT_TYPES: &[&str] =
    &["application/ld+json", "text/template", "text/x-template", "application/json", "importmap"];

fn script_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<script\b([^>]*)>(.*?)</script\s*>"#).expect("static regex")
    })
}

fn type_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)type\s*=\s*["']([^"']+)["']"#).expect("static regex"))
}

fn preload_script_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<link\b[^>]*\brel\s*=\s*["'](?:modulepreload|preload)["'][^>]*>"#)
            .expect("static regex")
    })
}

fn attr_value<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let re = Regex::new(&format!(r#"(?i){name}\s*=\s*["']([^"']*)["']"#)).ok()?;
    re.captures(attrs).map(|c| c.get(1).unwrap().as_str())
}

fn is_preserved_type(attrs: &str) -> bool {
    match type_attr_re().captures(attrs) {
        Some(c) => {
            let ty = c.get(1).unwrap().as_str().to_ascii_lowercase();
            PRESERVED_SCRIPT_TYPES.iter().any(|p| p.eq_ignore_ascii_case(&ty))
        }
        // No type attribute means the implicit `text/javascript` -- executable.
        None => false,
    }
}

fn is_preload_as_script(link_tag: &str) -> bool {
    let rel = attr_value(link_tag, "rel").unwrap_or_default().to_ascii_lowercase();
    if rel == "modulepreload" {
        return true;
    }
    if rel == "preload" {
        let as_attr = attr_value(link_tag, "as").unwrap_or_default().to_ascii_lowercase();
        return as_attr == "script";
    }
    false
}

/// Strip executable scripts and script-preload links from `html`,
/// preserving `<noscript>`, stylesheet/canonical links, and the data
/// script types listed in §4.7.
pub fn clean(html: &str) -> String {
    let without_scripts = script_tag_re().replace_all(html, |caps: &regex::Captures| {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if is_preserved_type(attrs) {
            caps.get(0).unwrap().as_str().to_string()
        } else {
            String::new()
        }
    });

    preload_script_link_re()
        .replace_all(&without_scripts, |caps: &regex::Captures| {
            let tag = caps.get(0).unwrap().as_str();
            if is_preload_as_script(tag) {
                String::new()
            } else {
                tag.to_string()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_inline_executable_script() {
        let html = r#"<html><head><script>alert(1)</script></head><body>x</body></html>"#;
        let cleaned = clean(html);
        assert!(!cleaned.contains("<script>"));
        assert!(cleaned.contains("<body>x</body>"));
    }

    #[test]
    fn removes_src_script() {
        let html = r#"<script src="/app.js"></script>"#;
        assert_eq!(clean(html).trim(), "");
    }

    #[test]
    fn preserves_ld_json() {
        let html = r#"<script type="application/ld+json">{"a":1}</script>"#;
        assert_eq!(clean(html), html);
    }

    #[test]
    fn preserves_importmap_and_templates() {
        for ty in ["importmap", "text/template", "text/x-template", "application/json"] {
            let html = format!(r#"<script type="{ty}">data</script>"#);
            assert_eq!(clean(&html), html);
        }
    }

    #[test]
    fn preserves_noscript() {
        let html = "<noscript>enable JS</noscript>";
        assert_eq!(clean(html), html);
    }

    #[test]
    fn removes_modulepreload_link() {
        let html = r#"<link rel="modulepreload" href="/chunk.js">"#;
        assert_eq!(clean(html).trim(), "");
    }

    #[test]
    fn removes_preload_as_script_link() {
        let html = r#"<link rel="preload" as="script" href="/chunk.js">"#;
        assert_eq!(clean(html).trim(), "");
    }

    #[test]
    fn preserves_preload_as_style_and_stylesheet_links() {
        let html = r#"<link rel="preload" as="style" href="/a.css"><link rel="stylesheet" href="/b.css"><link rel="canonical" href="https://example.com/">"#;
        assert_eq!(clean(html), html);
    }
}

//! URL normalization and cache-key derivation (§4.1).
//!
//! Produces a canonical string that is stable across hosts, parameter
//! orderings, and case folding, plus the stable 64-bit fingerprint derived
//! from it. Normalization never fails the request: a parse error is
//! recorded as [`crate::error::Error::BadUrl`] but the pipeline is expected
//! to fall back to the raw URL rather than abort.

use std::collections::BTreeMap;

use regex::Regex;
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;

/// A strip rule for tracking parameters: exact name, `prefix_*` wildcard, or
/// `~regex` (always matched against the lowercased parameter name).
#[derive(Debug, Clone)]
pub enum StripRule {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl StripRule {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(pattern) = raw.strip_prefix('~') {
            let re = Regex::new(&format!("(?i){pattern}"))
                .map_err(|e| Error::Config(format!("bad strip regex {raw:?}: {e}")))?;
            Ok(StripRule::Regex(re))
        } else if let Some(prefix) = raw.strip_suffix('*') {
            Ok(StripRule::Prefix(prefix.to_ascii_lowercase()))
        } else {
            Ok(StripRule::Exact(raw.to_ascii_lowercase()))
        }
    }

    fn matches(&self, lower_name: &str) -> bool {
        match self {
            StripRule::Exact(name) => lower_name == name,
            StripRule::Prefix(prefix) => lower_name.starts_with(prefix.as_str()),
            StripRule::Regex(re) => re.is_match(lower_name),
        }
    }
}

/// The effective tracking-strip policy for a single request: a three-level
/// merge (global → host → pattern) already resolved by the rule engine.
#[derive(Debug, Clone, Default)]
pub struct StripPolicy {
    pub rules: Vec<StripRule>,
}

impl StripPolicy {
    pub fn new(rules: Vec<StripRule>) -> Self {
        Self { rules }
    }

    fn should_strip(&self, lower_name: &str) -> bool {
        self.rules.iter().any(|r| r.matches(lower_name))
    }
}

/// Result of normalizing a URL: the canonical string, its fingerprint, and
/// the surviving (post-strip) query parameters in sorted order.
#[derive(Debug, Clone)]
pub struct NormalizedUrl {
    pub canonical: String,
    pub fingerprint: u64,
    pub query: Vec<(String, String)>,
}

/// Normalize `raw` under `policy`. Idempotent: `normalize(normalize(x).canonical) ==
/// normalize(x)` for any stable policy, since the output never carries a
/// parameter the policy would strip and parameters are always re-sorted.
pub fn normalize(raw: &str, policy: &StripPolicy) -> Result<NormalizedUrl> {
    let mut url = Url::parse(raw).map_err(|e| Error::BadUrl(format!("{raw}: {e}")))?;

    url.set_fragment(None);

    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();

    let default_port = match scheme.as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    let port = url.port();
    let has_explicit_port = matches!((port, default_port), (Some(p), Some(d)) if p != d)
        || matches!((port, default_port), (Some(_), None));

    let path = normalize_path(url.path());

    let mut kept: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        let lower_name = name.to_ascii_lowercase();
        if policy.should_strip(&lower_name) {
            continue;
        }
        kept.insert(name.into_owned(), value.into_owned());
    }

    let mut canonical = String::new();
    canonical.push_str(&scheme);
    canonical.push_str("://");
    canonical.push_str(&host);
    if has_explicit_port {
        if let Some(p) = port {
            canonical.push(':');
            canonical.push_str(&p.to_string());
        }
    }
    canonical.push_str(&path);

    let query: Vec<(String, String)> = kept.into_iter().collect();
    if !query.is_empty() {
        canonical.push('?');
        let parts: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        canonical.push_str(&parts.join("&"));
    }

    let fp = fingerprint(&canonical);

    Ok(NormalizedUrl { canonical, fingerprint: fp, query })
}

/// Resolve `.` and `..` path segments without touching percent-encoding.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(names: &[&str]) -> StripPolicy {
        StripPolicy::new(names.iter().map(|n| StripRule::parse(n).unwrap()).collect())
    }

    #[test]
    fn strips_tracking_params_and_keeps_others() {
        let p = policy(&["utm_source", "gclid"]);
        let a = normalize("http://h/p?utm_source=a&product=x", &p).unwrap();
        let b = normalize("http://h/p?gclid=g&product=x", &p).unwrap();
        let c = normalize("http://h/p?product=x", &p).unwrap();
        assert_eq!(a.canonical, "http://h/p?product=x");
        assert_eq!(a.canonical, b.canonical);
        assert_eq!(a.canonical, c.canonical);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn case_insensitive_tracking_name_match() {
        let p = policy(&["utm_source"]);
        let a = normalize("http://h/p?UTM_SOURCE=x", &p).unwrap();
        let b = normalize("http://h/p", &p).unwrap();
        assert_eq!(a.canonical, b.canonical);
    }

    #[test]
    fn parameter_order_independence() {
        let p = policy(&[]);
        let a = normalize("http://h/p?a=1&b=2", &p).unwrap();
        let b = normalize("http://h/p?b=2&a=1", &p).unwrap();
        assert_eq!(a.canonical, b.canonical);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn lowercases_scheme_and_host() {
        let p = policy(&[]);
        let n = normalize("HTTP://Example.COM/Path", &p).unwrap();
        assert_eq!(n.canonical, "http://example.com/Path");
    }

    #[test]
    fn strips_default_port_keeps_nonstandard() {
        let p = policy(&[]);
        let n = normalize("http://h:80/p", &p).unwrap();
        assert_eq!(n.canonical, "http://h/p");
        let n2 = normalize("http://h:8080/p", &p).unwrap();
        assert_eq!(n2.canonical, "http://h:8080/p");
    }

    #[test]
    fn strips_fragment() {
        let p = policy(&[]);
        let n = normalize("http://h/p#frag", &p).unwrap();
        assert_eq!(n.canonical, "http://h/p");
    }

    #[test]
    fn resolves_dot_segments() {
        let p = policy(&[]);
        let n = normalize("http://h/a/b/../c", &p).unwrap();
        assert_eq!(n.canonical, "http://h/a/c");
    }

    #[test]
    fn drops_trailing_question_mark_when_no_params_remain() {
        let p = policy(&["utm_source"]);
        let n = normalize("http://h/p?utm_source=x", &p).unwrap();
        assert_eq!(n.canonical, "http://h/p");
    }

    #[test]
    fn preserves_empty_value_params_not_matching_strip_rule() {
        let p = policy(&["utm_source"]);
        let n = normalize("http://h/p?kept=", &p).unwrap();
        assert_eq!(n.canonical, "http://h/p?kept=");
    }

    #[test]
    fn wildcard_prefix_strip_rule() {
        let p = policy(&["utm_*"]);
        let n = normalize("http://h/p?utm_anything=x&kept=y", &p).unwrap();
        assert_eq!(n.canonical, "http://h/p?kept=y");
    }

    #[test]
    fn regex_strip_rule() {
        let p = policy(&["~^fb.*"]);
        let n = normalize("http://h/p?fbclid=x&kept=y", &p).unwrap();
        assert_eq!(n.canonical, "http://h/p?kept=y");
    }

    #[test]
    fn idempotent() {
        let p = policy(&["utm_source"]);
        let once = normalize("HTTP://H/p?utm_source=a&b=2&a=1", &p).unwrap();
        let twice = normalize(&once.canonical, &p).unwrap();
        assert_eq!(once.canonical, twice.canonical);
    }

    #[test]
    fn bad_url_reports_error_not_panic() {
        let p = policy(&[]);
        assert!(normalize("not a url", &p).is_err());
    }
}

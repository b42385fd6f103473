//! The rule engine (§4.2): match a normalized URL against a host's ordered
//! pattern list, first-match-wins, with query-predicate tie-breaking and a
//! three-level (global → host → pattern) config merge.

use std::collections::{BTreeSet, HashMap};

use regex::Regex;

use crate::error::{Error, Result};
use crate::hosts::{Action, GlobalDefaults, Host, Rule};
use crate::normalize::{StripPolicy, StripRule};

/// The resolved outcome of matching a URL against a host's rule list.
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub action: Action,
    /// The literal pattern string, for the `X-Matched-Rule` diagnostic header.
    pub pattern: String,
    pub cache_ttl_secs: Option<u64>,
    pub safe_headers: BTreeSet<String>,
    pub strip_policy: StripPolicy,
    pub dimensions: Option<Vec<String>>,
}

/// Resolve the first matching rule for `path`/`query`, or the implicit
/// default (`render`, no overrides) when no rule matches.
pub fn resolve_rule(
    global: &GlobalDefaults,
    host: &Host,
    path: &str,
    query: &HashMap<String, Vec<String>>,
) -> Result<MatchedRule> {
    for rule in &host.rules {
        if !path_matches(&rule.pattern, path)? {
            continue;
        }
        if !predicates_satisfied(rule, query)? {
            continue;
        }
        return Ok(build_matched(global, host, rule)?);
    }

    Ok(MatchedRule {
        action: Action::Render,
        pattern: String::new(),
        cache_ttl_secs: None,
        safe_headers: merged_set(&global.safe_headers, &host.safe_headers, None),
        strip_policy: merged_strip_policy(&global.strip_params, &host.strip_params, None)?,
        dimensions: None,
    })
}

fn build_matched(global: &GlobalDefaults, host: &Host, rule: &Rule) -> Result<MatchedRule> {
    let safe_headers = merged_set(
        &global.safe_headers,
        &host.safe_headers,
        rule.overrides.safe_headers.as_deref(),
    );
    let strip_policy = merged_strip_policy(
        &global.strip_params,
        &host.strip_params,
        rule.overrides.strip_params.as_deref(),
    )?;

    Ok(MatchedRule {
        action: rule.parsed_action()?,
        pattern: rule.pattern.clone(),
        cache_ttl_secs: rule.overrides.cache_ttl_secs,
        safe_headers,
        strip_policy,
        dimensions: rule.overrides.dimensions.clone(),
    })
}

/// Union merge across global/host/pattern levels, except the pattern level
/// *replaces* when it is present and non-empty (§4.2).
fn merged_set(global: &[String], host: &[String], pattern: Option<&[String]>) -> BTreeSet<String> {
    if let Some(p) = pattern {
        if !p.is_empty() {
            return p.iter().map(|s| s.to_ascii_lowercase()).collect();
        }
    }
    global
        .iter()
        .chain(host.iter())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

fn merged_strip_policy(
    global: &[String],
    host: &[String],
    pattern: Option<&[String]>,
) -> Result<StripPolicy> {
    let raw: Vec<&String> = if let Some(p) = pattern {
        if !p.is_empty() {
            p.iter().collect()
        } else {
            global.iter().chain(host.iter()).collect()
        }
    } else {
        global.iter().chain(host.iter()).collect()
    };

    let rules = raw
        .into_iter()
        .map(|s| StripRule::parse(s))
        .collect::<Result<Vec<_>>>()?;
    Ok(StripPolicy::new(rules))
}

/// Check whether `path` matches `pattern` under the five forms in §4.2:
/// exact, prefix wildcard, middle wildcard, extension, regex.
fn path_matches(pattern: &str, path: &str) -> Result<bool> {
    if let Some(regex_src) = pattern.strip_prefix('~') {
        let re = Regex::new(regex_src).map_err(|e| Error::Config(format!("bad rule regex {pattern:?}: {e}")))?;
        return Ok(re.is_match(path));
    }

    if let Some(ext) = pattern.strip_prefix("*.") {
        let path_ext = path.rsplit('.').next().unwrap_or("");
        return Ok(!path_ext.is_empty() && path_ext.eq_ignore_ascii_case(ext));
    }

    if let Some(prefix) = pattern.strip_suffix("/*") {
        return Ok(path == prefix || path.starts_with(&format!("{prefix}/")));
    }

    if pattern.contains("/*/") {
        return Ok(middle_wildcard_matches(pattern, path));
    }

    Ok(canonical(pattern) == canonical(path))
}

/// Trailing slash is optional for exact matches (§4.2).
fn canonical(path: &str) -> &str {
    path.strip_suffix('/').filter(|s| !s.is_empty()).unwrap_or(path)
}

fn middle_wildcard_matches(pattern: &str, path: &str) -> bool {
    let pat_segs: Vec<&str> = pattern.split('/').collect();
    let path_segs: Vec<&str> = path.split('/').collect();
    if pat_segs.len() != path_segs.len() {
        return false;
    }
    for (p, actual) in pat_segs.iter().zip(path_segs.iter()) {
        if *p == "*" {
            if actual.is_empty() {
                return false;
            }
        } else if p != actual {
            return false;
        }
    }
    true
}

fn predicates_satisfied(rule: &Rule, query: &HashMap<String, Vec<String>>) -> Result<bool> {
    let predicates = rule.query_predicates()?;
    for (name, predicate) in &predicates {
        let observed = query.get(name).cloned().unwrap_or_default();
        if !predicate.matches(&observed) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::HostTable;

    fn host_with_rules(yaml: &str) -> (GlobalDefaults, Host) {
        let table = HostTable::load_from_str(yaml).unwrap();
        (table.global, table.hosts.into_iter().next().unwrap())
    }

    #[test]
    fn first_match_wins_rule_priority() {
        let yaml = r#"
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    rules:
      - pattern: "/exact/path"
        action: status_403
      - pattern: "/exact/*"
        action: render
"#;
        let (global, host) = host_with_rules(yaml);
        let empty = HashMap::new();

        let r1 = resolve_rule(&global, &host, "/exact/path", &empty).unwrap();
        assert_eq!(r1.action, Action::Status(403));
        assert_eq!(r1.pattern, "/exact/path");

        let r2 = resolve_rule(&global, &host, "/exact/path/sub", &empty).unwrap();
        assert_eq!(r2.action, Action::Render);
        assert_eq!(r2.pattern, "/exact/*");
    }

    #[test]
    fn no_match_defaults_to_render() {
        let yaml = r#"
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    rules: []
"#;
        let (global, host) = host_with_rules(yaml);
        let r = resolve_rule(&global, &host, "/anything", &HashMap::new()).unwrap();
        assert_eq!(r.action, Action::Render);
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let yaml = r#"
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    rules:
      - pattern: "*.PDF"
        action: bypass
"#;
        let (global, host) = host_with_rules(yaml);
        let r = resolve_rule(&global, &host, "/doc.pdf", &HashMap::new()).unwrap();
        assert_eq!(r.action, Action::Bypass);
    }

    #[test]
    fn middle_wildcard_requires_nonempty_single_segment() {
        let yaml = r#"
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    rules:
      - pattern: "/a/*/c"
        action: bypass
"#;
        let (global, host) = host_with_rules(yaml);
        assert_eq!(
            resolve_rule(&global, &host, "/a/b/c", &HashMap::new()).unwrap().action,
            Action::Bypass
        );
        assert_eq!(
            resolve_rule(&global, &host, "/a//c", &HashMap::new()).unwrap().action,
            Action::Render
        );
        assert_eq!(
            resolve_rule(&global, &host, "/a/b/d/c", &HashMap::new()).unwrap().action,
            Action::Render
        );
    }

    #[test]
    fn query_predicate_failure_falls_through_to_next_rule() {
        let yaml = r#"
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    rules:
      - pattern: "/p"
        query:
          debug: "true"
        action: status_403
      - pattern: "/p"
        action: render
"#;
        let (global, host) = host_with_rules(yaml);
        let mut q = HashMap::new();
        q.insert("debug".to_string(), vec!["false".to_string()]);
        let r = resolve_rule(&global, &host, "/p", &q).unwrap();
        assert_eq!(r.action, Action::Render);

        let mut q2 = HashMap::new();
        q2.insert("debug".to_string(), vec!["true".to_string()]);
        let r2 = resolve_rule(&global, &host, "/p", &q2).unwrap();
        assert_eq!(r2.action, Action::Status(403));
    }

    #[test]
    fn pattern_level_strip_params_replaces_merged_set() {
        let yaml = r#"
global:
  strip_params: ["utm_source"]
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    strip_params: ["gclid"]
    rules:
      - pattern: "/special"
        action: render
        strip_params: ["only_this"]
"#;
        let (global, host) = host_with_rules(yaml);
        let r = resolve_rule(&global, &host, "/special", &HashMap::new()).unwrap();
        assert_eq!(r.strip_policy.rules.len(), 1);
    }

    #[test]
    fn no_pattern_override_merges_global_and_host_strip_sets() {
        let yaml = r#"
global:
  strip_params: ["utm_source"]
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    strip_params: ["gclid"]
    rules: []
"#;
        let (global, host) = host_with_rules(yaml);
        let r = resolve_rule(&global, &host, "/anything", &HashMap::new()).unwrap();
        assert_eq!(r.strip_policy.rules.len(), 2);
    }

    #[test]
    fn exact_match_trailing_slash_optional() {
        let yaml = r#"
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    rules:
      - pattern: "/a/b"
        action: bypass
"#;
        let (global, host) = host_with_rules(yaml);
        assert_eq!(
            resolve_rule(&global, &host, "/a/b/", &HashMap::new()).unwrap().action,
            Action::Bypass
        );
    }

    #[test]
    fn regex_pattern_with_case_insensitive_flag() {
        let yaml = r#"
hosts:
  - id: 1
    domains: ["h"]
    render_key: "k"
    rules:
      - pattern: "~(?i)^/Secret/.*"
        action: block
"#;
        let (global, host) = host_with_rules(yaml);
        assert_eq!(
            resolve_rule(&global, &host, "/secret/area", &HashMap::new()).unwrap().action,
            Action::Block
        );
    }
}

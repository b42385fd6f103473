//! The host/dimension/rule table (§3): the administrative data model,
//! loaded once at startup from YAML. Hot-reload is out of scope -- a
//! redesign of the whole table, per §3.
//!
//! YAML parsing itself is plumbing (Non-goal); this module owns the
//! *shape* of the table and the validation that makes it fatal-at-startup
//! rather than fatal-at-request-time.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bot_alias::validate_aliases;
use crate::error::{Error, Result};

/// Fallback behavior when no dimension matches the request's User-Agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedDimensionPolicy {
    Block,
    Bypass,
    /// Fall back to the named dimension, rendered, marked unmatched.
    Dimension(String),
}

impl UnmatchedDimensionPolicy {
    /// Parse the bare YAML string form: `block`, `bypass`, or a dimension name.
    fn from_raw(raw: &str) -> Self {
        match raw {
            "block" => UnmatchedDimensionPolicy::Block,
            "bypass" => UnmatchedDimensionPolicy::Bypass,
            other => UnmatchedDimensionPolicy::Dimension(other.to_string()),
        }
    }
}

/// Rendering profile: viewport plus the UA sent to origin and the ordered
/// list of patterns/alias-refs that select this dimension (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    pub id: u64,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub render_ua: String,
    /// Raw entries: `$Alias`, `*substring*`, `~regex`, or an exact literal.
    #[serde(default)]
    pub match_ua: Vec<String>,
}

/// One query-parameter predicate under a rule (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryPredicate {
    /// `*` meaning "present and non-empty".
    Wildcard(WildcardMarker),
    Exact(String),
    AnyOf(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WildcardMarker;

impl QueryPredicate {
    /// Parse the raw YAML scalar/sequence form, recognizing the bare `*`
    /// string as the non-empty wildcard.
    pub fn from_str_or_list(raw: &serde_yaml::Value) -> Result<Self> {
        match raw {
            serde_yaml::Value::String(s) if s == "*" => Ok(QueryPredicate::Wildcard(WildcardMarker)),
            serde_yaml::Value::String(s) => Ok(QueryPredicate::Exact(s.clone())),
            serde_yaml::Value::Sequence(items) => {
                let values: Result<Vec<String>> = items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(|s| s.to_string())
                            .ok_or_else(|| Error::Config("query predicate list entries must be strings".into()))
                    })
                    .collect();
                Ok(QueryPredicate::AnyOf(values?))
            }
            other => Err(Error::Config(format!("invalid query predicate: {other:?}"))),
        }
    }

    /// Check this predicate against the (possibly multi-valued) query
    /// parameter values observed for its name. Names match case-sensitively
    /// elsewhere; scalar values here match case-insensitively; multi-valued
    /// parameters compare against the first value only (§3).
    pub fn matches(&self, observed: &[String]) -> bool {
        match self {
            QueryPredicate::Wildcard(_) => observed.first().is_some_and(|v| !v.is_empty()),
            QueryPredicate::Exact(expected) => observed
                .first()
                .is_some_and(|v| v.eq_ignore_ascii_case(expected)),
            QueryPredicate::AnyOf(expected) => observed
                .first()
                .is_some_and(|v| expected.iter().any(|e| e.eq_ignore_ascii_case(v))),
        }
    }
}

/// The action a matched rule resolves to (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum Action {
    Render,
    Bypass,
    Status(u16),
    Block,
}

impl Action {
    /// Parse the compact YAML form: `render`, `bypass`, `block`, or
    /// `status_NNN`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "render" => Ok(Action::Render),
            "bypass" => Ok(Action::Bypass),
            "block" => Ok(Action::Block),
            other => {
                if let Some(code) = other.strip_prefix("status_") {
                    let code: u16 = code
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid status action {other:?}")))?;
                    Ok(Action::Status(code))
                } else {
                    Err(Error::Config(format!("unknown action {other:?}")))
                }
            }
        }
    }
}

/// Per-pattern cache/header/strip overrides, merged three levels deep
/// (global → host → rule) per §4.2.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleOverrides {
    pub cache_ttl_secs: Option<u64>,
    /// `Some` replaces the merged safe-header set for this pattern only.
    pub safe_headers: Option<Vec<String>>,
    /// `Some` replaces the merged tracking-strip set for this pattern only.
    pub strip_params: Option<Vec<String>>,
    pub dimensions: Option<Vec<String>>,
}

/// One pattern entry under a host (§3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    #[serde(default)]
    pub query: HashMap<String, serde_yaml::Value>,
    pub action: String,
    #[serde(flatten)]
    pub overrides: RuleOverrides,
}

impl Rule {
    pub fn parsed_action(&self) -> Result<Action> {
        Action::parse(&self.action)
    }

    pub fn query_predicates(&self) -> Result<HashMap<String, QueryPredicate>> {
        self.query
            .iter()
            .map(|(k, v)| Ok((k.clone(), QueryPredicate::from_str_or_list(v)?)))
            .collect()
    }
}

/// The administrative unit (§3): a set of domains sharing render config,
/// dimensions, and rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: u64,
    pub domains: Vec<String>,
    pub render_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub strip_params: Vec<String>,
    #[serde(default)]
    pub safe_headers: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_unmatched")]
    pub unmatched_dimension: String,
}

fn default_enabled() -> bool {
    true
}
fn default_unmatched() -> String {
    "block".to_string()
}

impl Host {
    pub fn unmatched_policy(&self) -> UnmatchedDimensionPolicy {
        UnmatchedDimensionPolicy::from_raw(&self.unmatched_dimension)
    }

    /// Case-insensitive domain membership; multi-domain hosts authenticate
    /// equivalently via any listed domain (§4.9 RESOLVE_HOST).
    pub fn matches_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    pub fn dimension_by_name(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }
}

/// Global (cross-host) defaults: the first merge level for strip/header
/// sets (§4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalDefaults {
    #[serde(default)]
    pub strip_params: Vec<String>,
    #[serde(default)]
    pub safe_headers: Vec<String>,
}

/// The full, load-once host/dimension/rule table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostTable {
    #[serde(default)]
    pub global: GlobalDefaults,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

impl HostTable {
    pub fn load_from_str(yaml: &str) -> Result<Self> {
        let table: HostTable =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("hosts.yaml: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    /// Load a base file plus every `*.yaml`/`*.yml` file in an optional
    /// sibling `hosts.d/` directory, appending their hosts to the base
    /// table (§6 config surface).
    pub fn load_from_dir(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref();
        let raw = std::fs::read_to_string(base_path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", base_path.display())))?;
        let mut table: HostTable =
            serde_yaml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", base_path.display())))?;

        if let Some(parent) = base_path.parent() {
            let split_dir = parent.join("hosts.d");
            if split_dir.is_dir() {
                let mut entries: Vec<_> = std::fs::read_dir(&split_dir)
                    .map_err(|e| Error::Config(format!("reading {}: {e}", split_dir.display())))?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
                    })
                    .collect();
                entries.sort();
                for path in entries {
                    let raw = std::fs::read_to_string(&path)
                        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
                    let fragment: HostTable = serde_yaml::from_str(&raw)
                        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                    table.hosts.extend(fragment.hosts);
                }
            }
        }

        table.validate()?;
        Ok(table)
    }

    /// Fatal validation: every `$Alias` referenced by any dimension must
    /// resolve, and unresolved aliases are reported as a complete listing
    /// (§3, §6).
    fn validate(&self) -> Result<()> {
        let mut alias_refs: Vec<&str> = Vec::new();
        for host in &self.hosts {
            for dim in &host.dimensions {
                for entry in &dim.match_ua {
                    if let Some(alias) = entry.strip_prefix('$') {
                        alias_refs.push(alias);
                    }
                }
            }
        }

        if let Err(unknown) = validate_aliases(alias_refs) {
            return Err(Error::Config(format!(
                "unresolved bot alias references: {}",
                unknown.join(", ")
            )));
        }

        for host in &self.hosts {
            for rule in &host.rules {
                rule.parsed_action()?;
            }
        }

        for host in &self.hosts {
            for dim in &host.dimensions {
                if dim.id == 0 {
                    return Err(Error::Config(format!(
                        "host {} dimension {:?}: id 0 is reserved for \"no dimension resolved\" and cannot be assigned to a configured dimension",
                        host.id, dim.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn resolve_host(&self, domain: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.enabled && h.matches_domain(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
global:
  strip_params: ["utm_source", "utm_medium"]
  safe_headers: ["content-type", "cache-control"]
hosts:
  - id: 1
    domains: ["example.com", "www.example.com"]
    render_key: "secret"
    unmatched_dimension: bypass
    dimensions:
      - id: 1
        name: desktop
        width: 1920
        height: 1080
        render_ua: "EdgeCometBot/1.0"
        match_ua: ["$GPTBot", "*chrome*"]
    rules:
      - pattern: "/exact/path"
        action: status_403
      - pattern: "/exact/*"
        action: render
"#
    }

    #[test]
    fn loads_valid_table() {
        let table = HostTable::load_from_str(sample_yaml()).unwrap();
        assert_eq!(table.hosts.len(), 1);
        assert_eq!(table.hosts[0].rules.len(), 2);
    }

    #[test]
    fn unknown_alias_is_fatal_and_lists_all_offenders() {
        let yaml = sample_yaml().replace("$GPTBot", "$NotReal");
        let err = HostTable::load_from_str(&yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("NotReal"));
    }

    #[test]
    fn dimension_id_zero_is_fatal() {
        let yaml = sample_yaml().replace("id: 1\n        name: desktop", "id: 0\n        name: desktop");
        let err = HostTable::load_from_str(&yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn domain_match_is_case_insensitive() {
        let table = HostTable::load_from_str(sample_yaml()).unwrap();
        assert!(table.resolve_host("EXAMPLE.com").is_some());
        assert!(table.resolve_host("www.EXAMPLE.com").is_some());
        assert!(table.resolve_host("other.com").is_none());
    }

    #[test]
    fn disabled_host_does_not_resolve() {
        let yaml = sample_yaml().replace("render_key: \"secret\"", "render_key: \"secret\"\n    enabled: false");
        let table = HostTable::load_from_str(&yaml).unwrap();
        assert!(table.resolve_host("example.com").is_none());
    }

    #[test]
    fn unmatched_dimension_policy_parses_named_fallback() {
        let table = HostTable::load_from_str(sample_yaml()).unwrap();
        assert_eq!(
            table.hosts[0].unmatched_policy(),
            UnmatchedDimensionPolicy::Bypass
        );
    }

    #[test]
    fn action_parses_status_code() {
        let table = HostTable::load_from_str(sample_yaml()).unwrap();
        assert_eq!(table.hosts[0].rules[0].parsed_action().unwrap(), Action::Status(403));
        assert_eq!(table.hosts[0].rules[1].parsed_action().unwrap(), Action::Render);
    }

    #[test]
    fn query_predicate_wildcard_requires_non_empty() {
        let pred = QueryPredicate::Wildcard(WildcardMarker);
        assert!(pred.matches(&["x".to_string()]));
        assert!(!pred.matches(&["".to_string()]));
        assert!(!pred.matches(&[]));
    }

    #[test]
    fn query_predicate_exact_is_case_insensitive() {
        let pred = QueryPredicate::Exact("Foo".to_string());
        assert!(pred.matches(&["foo".to_string()]));
    }
}

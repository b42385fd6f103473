//! The dimension resolver (§4.3): map a User-Agent to a rendering profile
//! by expanding each dimension's `match_ua` entries (bot-alias refs,
//! wildcards, regexes, exact literals) and returning the first match.

use crate::bot_alias::{resolve_alias, UaPattern};
use crate::error::{Error, Result};
use crate::hosts::{Dimension, Host, UnmatchedDimensionPolicy};

/// Outcome of resolving a User-Agent against a host's dimension list.
#[derive(Debug, Clone)]
pub struct DimensionResolution<'a> {
    pub dimension: &'a Dimension,
    /// Set when no dimension's patterns matched and the named-dimension
    /// fallback was used (§4.3).
    pub unmatched: bool,
}

/// What to do when no dimension matches and the host's fallback isn't a
/// named dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    Block,
    Bypass,
}

pub enum Resolution<'a> {
    Matched(DimensionResolution<'a>),
    Fallback(Fallback),
}

/// Resolve `ua` against `host`'s dimensions, applying `unmatched_dimension`
/// on failure (§4.3). Both organic browser UAs and alias-matched bot UAs
/// traverse this same code path.
pub fn resolve_dimension<'a>(host: &'a Host, ua: &str) -> Result<Resolution<'a>> {
    for dim in &host.dimensions {
        if dimension_matches(dim, ua)? {
            return Ok(Resolution::Matched(DimensionResolution { dimension: dim, unmatched: false }));
        }
    }

    match host.unmatched_policy() {
        UnmatchedDimensionPolicy::Block => Ok(Resolution::Fallback(Fallback::Block)),
        UnmatchedDimensionPolicy::Bypass => Ok(Resolution::Fallback(Fallback::Bypass)),
        UnmatchedDimensionPolicy::Dimension(name) => {
            let dim = host
                .dimension_by_name(&name)
                .ok_or_else(|| Error::Config(format!("unmatched_dimension fallback {name:?} is not a defined dimension")))?;
            Ok(Resolution::Matched(DimensionResolution { dimension: dim, unmatched: true }))
        }
    }
}

fn dimension_matches(dim: &Dimension, ua: &str) -> Result<bool> {
    for entry in &dim.match_ua {
        if let Some(alias) = entry.strip_prefix('$') {
            let patterns = resolve_alias(alias).map_err(|e| Error::Config(e.to_string()))?;
            if patterns.iter().any(|p| p.matches(ua)) {
                return Ok(true);
            }
        } else if let Some(inner) = entry.strip_prefix('*').and_then(|s| s.strip_suffix('*')) {
            if UaPattern::Wildcard(inner.to_string()).matches(ua) {
                return Ok(true);
            }
        } else if let Some(pattern) = entry.strip_prefix('~') {
            if UaPattern::Regex(pattern.to_string()).matches(ua) {
                return Ok(true);
            }
        } else if UaPattern::Exact(entry.clone()).matches(ua) {
            return Ok(true);
        }
    }
    Ok(false)
}

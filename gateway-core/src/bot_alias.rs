//! The bot-alias registry (§6, §9): a closed, compile-time table mapping
//! names like `GooglebotSearchDesktop` to ordered User-Agent match pattern
//! lists. This is the single source of truth; unknown `$Alias` references
//! in the host table are a fatal config error.

use regex::Regex;

/// One User-Agent match pattern, in the same three forms the rule engine's
/// custom `match_ua` entries support.
#[derive(Debug, Clone)]
pub enum UaPattern {
    Exact(String),
    /// `*substring*` -- case-insensitive substring match.
    Wildcard(String),
    /// `~pattern` -- anchored, case-insensitive regex.
    Regex(String),
}

impl UaPattern {
    pub fn matches(&self, ua: &str) -> bool {
        match self {
            UaPattern::Exact(s) => ua.eq_ignore_ascii_case(s),
            UaPattern::Wildcard(needle) => {
                ua.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
            UaPattern::Regex(pattern) => {
                Regex::new(&format!("(?i){pattern}")).map(|re| re.is_match(ua)).unwrap_or(false)
            }
        }
    }
}

fn exact(s: &str) -> UaPattern {
    UaPattern::Exact(s.to_string())
}
fn wildcard(s: &str) -> UaPattern {
    UaPattern::Wildcard(s.to_string())
}

/// Error raised when a dimension references `$Alias` and `Alias` is not in
/// the registry. Config loading collects every offender before failing so
/// the operator sees the complete list in one pass.
#[derive(Debug, thiserror::Error)]
#[error("unknown bot alias: {0}")]
pub struct UnknownAliasError(pub String);

/// Resolve a bot-alias name (case-sensitive) to its ordered pattern list.
pub fn resolve_alias(name: &str) -> Result<Vec<UaPattern>, UnknownAliasError> {
    let patterns = match name {
        "GooglebotSearchDesktop" => vec![
            wildcard("googlebot/"),
            wildcard("googlebot (+http"),
        ],
        "GooglebotSearchMobile" => vec![wildcard("googlebot") /* matches desktop too, listed after */],
        "GooglebotImage" => vec![wildcard("googlebot-image")],
        "BingbotDesktop" => vec![wildcard("bingbot/")],
        "BingPreview" => vec![wildcard("bingpreview")],
        "DuckDuckBot" => vec![wildcard("duckduckbot")],
        "YandexBot" => vec![wildcard("yandexbot")],
        "Baiduspider" => vec![wildcard("baiduspider")],
        "ApplebotDesktop" => vec![wildcard("applebot")],
        "FacebookExternalHit" => vec![wildcard("facebookexternalhit"), wildcard("facebot")],
        "TwitterBot" => vec![wildcard("twitterbot")],
        "LinkedInBot" => vec![wildcard("linkedinbot")],
        "SlackBot" => vec![wildcard("slackbot")],
        "DiscordBot" => vec![wildcard("discordbot")],
        "TelegramBot" => vec![wildcard("telegrambot")],
        "WhatsApp" => vec![wildcard("whatsapp")],
        "AhrefsBot" => vec![wildcard("ahrefsbot")],
        "SemrushBot" => vec![wildcard("semrushbot")],
        "MJ12bot" => vec![wildcard("mj12bot")],
        "ChatGPTUserBot" => vec![wildcard("chatgpt-user")],
        "GPTBot" => vec![wildcard("gptbot")],
        "OAISearchBot" => vec![wildcard("oai-searchbot")],
        "ClaudeBot" => vec![wildcard("claudebot")],
        "ClaudeWebBot" => vec![wildcard("claude-web")],
        "Claude-SearchBot" => vec![wildcard("claude-searchbot")],
        "PerplexityBot" => vec![wildcard("perplexitybot")],
        "PerplexityUser" => vec![wildcard("perplexity-user")],
        "Amazonbot" => vec![wildcard("amazonbot")],
        "Bytespider" => vec![wildcard("bytespider")],
        "CCBot" => vec![wildcard("ccbot")],
        "PetalBot" => vec![wildcard("petalbot")],
        "ExactGooglebotUA" => vec![exact(
            "Googlebot/2.1 (+http://www.google.com/bot.html)",
        )],
        other => return Err(UnknownAliasError(other.to_string())),
    };
    Ok(patterns)
}

/// Validate every alias referenced by a dimension set, returning *all*
/// unresolved names (not just the first) so the operator gets a complete
/// listing in one config error.
pub fn validate_aliases<'a>(refs: impl IntoIterator<Item = &'a str>) -> Result<(), Vec<String>> {
    let mut unknown = Vec::new();
    for name in refs {
        if resolve_alias(name).is_err() {
            unknown.push(name.to_string());
        }
    }
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(unknown)
    }
}

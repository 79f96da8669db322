//! Marketplace search-link synthesis from free-text descriptions.
//!
//! Pure string construction: no network access.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Words that carry no product meaning.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "with", "for", "and", "or", "but", "in", "on", "at", "to", "of", "is",
    "are", "was", "were",
];

/// Keywords kept from a description.
pub const MAX_KEYWORDS: usize = 7;

/// Tokens this short (in characters) are dropped.
const MIN_TOKEN_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TargetSite {
    #[default]
    Amazon,
    /// Google Shopping.
    Google,
    Ebay,
    /// Plain Google web search.
    Web,
}

impl TargetSite {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amazon => "amazon",
            Self::Google => "google",
            Self::Ebay => "ebay",
            Self::Web => "web",
        }
    }

    /// Parse a site name, falling back to generic web search for anything
    /// unrecognized.
    pub fn parse_lenient(site: &str) -> Self {
        site.parse().unwrap_or(Self::Web)
    }

    pub fn url_for_query(self, encoded_query: &str) -> String {
        match self {
            Self::Amazon => format!("https://www.amazon.com/s?k={encoded_query}"),
            Self::Google => format!("https://www.google.com/search?tbm=shop&q={encoded_query}"),
            Self::Ebay => format!("https://www.ebay.com/sch/i.html?_nkw={encoded_query}"),
            Self::Web => format!("https://www.google.com/search?q={encoded_query}"),
        }
    }
}

impl fmt::Display for TargetSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "amazon" => Ok(Self::Amazon),
            "google" | "google-shopping" | "shopping" => Ok(Self::Google),
            "ebay" => Ok(Self::Ebay),
            "web" | "generic" => Ok(Self::Web),
            other => Err(format!("unknown target site: {other}")),
        }
    }
}

/// Lowercase, strip `,` and `.`, split on whitespace, drop stop words and
/// tokens of two characters or fewer, keep the first [`MAX_KEYWORDS`].
pub fn extract_keywords(description: &str) -> Vec<String> {
    description
        .to_lowercase()
        .replace([',', '.'], "")
        .split_whitespace()
        .filter(|token| !STOP_WORDS.contains(token))
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .take(MAX_KEYWORDS)
        .map(str::to_string)
        .collect()
}

pub fn search_query(description: &str) -> String {
    extract_keywords(description).join(" ")
}

pub fn synthesize_url_for(description: &str, site: TargetSite) -> String {
    let query = search_query(description);
    site.url_for_query(&urlencoding::encode(&query))
}

/// String-keyed entry point: unknown sites use generic web search.
pub fn synthesize_url(description: &str, target_site: &str) -> String {
    synthesize_url_for(description, TargetSite::parse_lenient(target_site))
}

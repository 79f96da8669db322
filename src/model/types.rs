//! Catalog and result entity structs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Shown when the description table has no entry for an identifier.
pub const DESCRIPTION_PLACEHOLDER: &str = "Description not available";

/// One catalog image and its embedding. `identifier` is the canonical path.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub identifier: String,
    pub vector: Vec<f32>,
}

/// A ranked query hit. Ephemeral: built per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub identifier: String,
    pub score: f32,
    pub description: String,
    #[serde(rename = "url")]
    pub marketplace_url: String,
}

/// Collapse runs of `/` so "dataset//shoes/a.jpg" and "dataset/shoes/a.jpg"
/// name the same image.
pub fn canonical_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_slash = false;
    for c in raw.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

/// Identifier → free-text description. Possibly incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DescriptionTable {
    entries: HashMap<String, String>,
}

impl DescriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: impl AsRef<str>, description: impl Into<String>) {
        self.entries
            .insert(canonical_identifier(identifier.as_ref()), description.into());
    }

    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.entries
            .get(identifier)
            .or_else(|| self.entries.get(&canonical_identifier(identifier)))
            .map(String::as_str)
    }

    /// Description for `identifier`, or [`DESCRIPTION_PLACEHOLDER`].
    pub fn describe(&self, identifier: &str) -> &str {
        self.get(identifier).unwrap_or(DESCRIPTION_PLACEHOLDER)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-key every entry canonically. Tables read from disk may use either
    /// slash form. When several keys collapse to one identifier, a key that
    /// was already canonical wins, then the lexicographically smallest key.
    pub fn canonicalized(self) -> Self {
        let mut keyed: Vec<(bool, String, String)> = self
            .entries
            .into_iter()
            .map(|(identifier, description)| {
                let already = canonical_identifier(&identifier) == identifier;
                (!already, identifier, description)
            })
            .collect();
        keyed.sort_unstable_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let mut table = Self::new();
        for (_, identifier, description) in keyed {
            table
                .entries
                .entry(canonical_identifier(&identifier))
                .or_insert(description);
        }
        table
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for DescriptionTable {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut table = Self::new();
        for (identifier, description) in iter {
            table.insert(identifier, description);
        }
        table
    }
}

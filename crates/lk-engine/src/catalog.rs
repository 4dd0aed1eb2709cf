//! Default subscription catalog
//!
//! A JSON list of well-known remote subscriptions. One of them is picked for
//! the device language on first run; the others are registered disabled
//! unless flagged `enabled_by_default`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::error::{EngineError, Result};

const BUNDLED_CATALOG: &str = include_str!("../data/catalog.json");

#[derive(Debug, Deserialize)]
struct CatalogFile {
    default_url: String,
    subscriptions: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    title: String,
    url: String,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    enabled_by_default: bool,
}

/// One catalog subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub title: String,
    pub url: Url,
    pub homepage: Option<String>,
    /// Language codes this list is meant for
    pub languages: Vec<String>,
    /// Whether the list is usable on its own (not a supplement)
    pub complete: bool,
    pub enabled_by_default: bool,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    default_url: Url,
    entries: Vec<CatalogEntry>,
    by_url: HashMap<String, usize>,
}

/// Map retired ISO 639 codes to the ones used in the catalog.
fn normalize_language(language: &str) -> String {
    let primary = language
        .split(|c| c == '-' || c == '_')
        .next()
        .unwrap_or("")
        .to_lowercase();
    match primary.as_str() {
        "iw" => "he".to_string(),
        "ji" => "yi".to_string(),
        "in" => "id".to_string(),
        _ => primary,
    }
}

impl Catalog {
    /// The catalog compiled into the binary.
    pub fn bundled() -> Result<Self> {
        Self::from_json(BUNDLED_CATALOG)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Catalog(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_json::from_str(text).map_err(|e| EngineError::Catalog(e.to_string()))?;

        let parse = |raw: &str| {
            Url::parse(raw).map_err(|e| EngineError::Catalog(format!("invalid url {}: {}", raw, e)))
        };

        let default_url = parse(&file.default_url)?;
        let mut entries = Vec::with_capacity(file.subscriptions.len());
        let mut by_url = HashMap::new();
        for raw in file.subscriptions {
            let url = parse(&raw.url)?;
            by_url.insert(url.to_string(), entries.len());
            entries.push(CatalogEntry {
                title: raw.title,
                url,
                homepage: raw.homepage,
                languages: raw.languages,
                complete: raw.complete,
                enabled_by_default: raw.enabled_by_default,
            });
        }

        log::debug!("Loaded catalog with {} subscriptions", entries.len());
        Ok(Self {
            default_url,
            entries,
            by_url,
        })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn for_url(&self, url: &Url) -> Option<&CatalogEntry> {
        self.by_url.get(url.as_str()).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.by_url.contains_key(url.as_str())
    }

    /// Url of the complete list matching `language`, or the catalog default.
    pub fn choose_default(&self, language: &str) -> Url {
        let language = normalize_language(language);
        self.entries
            .iter()
            .find(|entry| entry.complete && entry.languages.iter().any(|l| *l == language))
            .map(|entry| entry.url.clone())
            .unwrap_or_else(|| self.default_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_catalog_parses() {
        let catalog = Catalog::bundled().unwrap();
        assert!(catalog.entries().len() >= 2);
        let easylist = Url::parse("https://easylist-downloads.adblockplus.org/easylist.txt").unwrap();
        assert_eq!(catalog.for_url(&easylist).unwrap().title, "EasyList");
    }

    #[test]
    fn test_choose_default_by_language() {
        let catalog = Catalog::bundled().unwrap();
        assert!(catalog.choose_default("de-AT").as_str().contains("easylistgermany"));
        assert!(catalog.choose_default("iw").as_str().contains("israellist"));
        assert!(catalog.choose_default("in_ID").as_str().contains("abpindo"));
    }

    #[test]
    fn test_choose_default_falls_back() {
        let catalog = Catalog::bundled().unwrap();
        assert_eq!(
            catalog.choose_default("tlh").as_str(),
            "https://easylist-downloads.adblockplus.org/easylist.txt"
        );
    }

    #[test]
    fn test_incomplete_list_never_default() {
        let catalog = Catalog::from_json(
            r#"{"default_url": "https://x/main.txt", "subscriptions": [
                {"title": "Supplement", "url": "https://x/nl.txt", "languages": ["nl"]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(catalog.choose_default("nl").as_str(), "https://x/main.txt");
    }

    #[test]
    fn test_invalid_catalog() {
        assert!(matches!(Catalog::from_json("<xml/>"), Err(EngineError::Catalog(_))));
        assert!(matches!(
            Catalog::from_json(r#"{"default_url": "nope", "subscriptions": []}"#),
            Err(EngineError::Catalog(_))
        ));
    }
}

//! Core type definitions for ListKeeper
//!
//! Identifiers and reserved metadata keys shared by the record format,
//! the registry and the command line tools.

use std::fmt;

use url::Url;

// =============================================================================
// Subscription Kind
// =============================================================================

/// Where a subscription's filters come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Downloaded from a URL and refreshed periodically
    Remote,
    /// User defined filters or exceptions, never downloaded
    Local,
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

// =============================================================================
// Subscription Id
// =============================================================================

/// Registry key of a subscription: `url:<url>` or `user:<title>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub const REMOTE_PREFIX: &'static str = "url:";
    pub const LOCAL_PREFIX: &'static str = "user:";

    pub fn remote(url: &Url) -> Self {
        Self(format!("{}{}", Self::REMOTE_PREFIX, url))
    }

    pub fn local(title: &str) -> Self {
        Self(format!("{}{}", Self::LOCAL_PREFIX, title))
    }

    /// Wrap an id received from a caller without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(Self::LOCAL_PREFIX)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

// =============================================================================
// Metadata Keys
// =============================================================================

/// Reserved metadata keys. Keys starting with `_` are engine bookkeeping and
/// can never be set from a downloaded list.
pub mod meta_keys {
    pub const TITLE: &str = "title";
    pub const VERSION: &str = "version";
    pub const HTTP_ETAG: &str = "_etag";
    pub const HTTP_LAST_MODIFIED: &str = "_last_modified";
    pub const UPDATE_TIMESTAMP: &str = "_update_timestamp";
    pub const TRIED_UPDATE_TIMESTAMP: &str = "_tried_update_timestamp";
    pub const DOWNLOAD_COUNT: &str = "_download_count";
    pub const ENABLED: &str = "_enabled";
    pub const META_HASH: &str = "_meta_hash";
    pub const FILTERS_HASH: &str = "_filters_hash";
    pub const DOWNLOAD_ONLY: &str = "_download_only";
    /// Registry key of a local subscription, independent of its title.
    pub const LOCAL_KEY: &str = "_local_key";

    /// Keys a downloaded list may set through `! key: value` lines.
    pub const DOWNLOADABLE: [&str; 7] = [
        "checksum",
        VERSION,
        TITLE,
        "last modified",
        "expires",
        "homepage",
        "licence",
    ];
}

/// Title of the local subscription holding user filters.
pub const USER_FILTERS_TITLE: &str = "__filters";

/// Title of the local subscription holding user exceptions.
pub const USER_EXCEPTIONS_TITLE: &str = "__exceptions";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_prefix() {
        let url = Url::parse("https://lists.example/easylist.txt").unwrap();
        let id = SubscriptionId::remote(&url);
        assert_eq!(id.as_str(), "url:https://lists.example/easylist.txt");
        assert!(!id.is_local());
    }

    #[test]
    fn test_local_id_prefix() {
        let id = SubscriptionId::local(USER_FILTERS_TITLE);
        assert_eq!(id.as_str(), "user:__filters");
        assert!(id.is_local());
    }

    #[test]
    fn test_raw_id_equals_derived() {
        let url = Url::parse("https://x/list.txt").unwrap();
        assert_eq!(SubscriptionId::from("url:https://x/list.txt"), SubscriptionId::remote(&url));
    }
}

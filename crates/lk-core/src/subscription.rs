//! Subscription entity
//!
//! A subscription keeps its metadata resident. Filters are only held while a
//! download is being applied or while the aggregate is compiled; the registry
//! clears them again once they are persisted.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::Rng;
use url::Url;

use crate::hash::content_hash;
use crate::types::{meta_keys, SubscriptionId, SubscriptionKind};

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Minimal time between two forced downloads of the same list.
pub const MINIMAL_DOWNLOAD_INTERVAL_MS: i64 = 5 * MINUTE_MS;
/// Back-off after a failed download attempt.
pub const DOWNLOAD_RETRY_INTERVAL_MS: i64 = HOUR_MS;
/// Base refresh interval of a regular list, before jitter.
pub const BASE_UPDATE_INTERVAL_MS: i64 = DAY_MS;
/// Upper bound of the random jitter added to the base interval.
pub const UPDATE_JITTER_MS: i64 = 8 * HOUR_MS;
/// Fixed refresh interval of download-only subscriptions.
pub const DOWNLOAD_ONLY_INTERVAL_MS: i64 = DAY_MS;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_long(value: Option<&String>) -> i64 {
    value.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(0)
}

/// A named, versioned filter list.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    kind: SubscriptionKind,
    url: Option<Url>,
    meta: BTreeMap<String, String>,
    filters: HashSet<String>,
    metadata_valid: bool,
    filters_valid: bool,
    update_interval_ms: i64,
}

impl Subscription {
    fn with_parts(id: SubscriptionId, kind: SubscriptionKind, url: Option<Url>) -> Self {
        let jitter = rand::thread_rng().gen_range(0..UPDATE_JITTER_MS);
        Self {
            id,
            kind,
            url,
            meta: BTreeMap::new(),
            filters: HashSet::new(),
            metadata_valid: true,
            filters_valid: true,
            update_interval_ms: BASE_UPDATE_INTERVAL_MS + jitter,
        }
    }

    /// Create a remote subscription downloaded from `url`.
    pub fn remote(url: Url) -> Self {
        let id = SubscriptionId::remote(&url);
        Self::with_parts(id, SubscriptionKind::Remote, Some(url))
    }

    /// Create a local subscription keyed by `key`, which is also its initial
    /// title. A later `! Title:` line renames it but never re-keys it.
    pub fn local(key: &str) -> Self {
        let mut sub = Self::with_parts(SubscriptionId::local(key), SubscriptionKind::Local, None);
        sub.meta.insert(meta_keys::LOCAL_KEY.to_string(), key.to_string());
        sub.meta.insert(meta_keys::TITLE.to_string(), key.to_string());
        sub
    }

    /// Rebuild a subscription from persisted parts.
    ///
    /// A local record is keyed by `_local_key`, falling back to its title for
    /// records written without one. Returns `None` when neither is present.
    pub fn from_parts(url: Option<Url>, mut meta: BTreeMap<String, String>) -> Option<Self> {
        let mut sub = match url {
            Some(url) => Self::remote(url),
            None => {
                let key = meta
                    .get(meta_keys::LOCAL_KEY)
                    .or_else(|| meta.get(meta_keys::TITLE))?
                    .clone();
                meta.entry(meta_keys::LOCAL_KEY.to_string()).or_insert_with(|| key.clone());
                Self::local(&key)
            }
        };
        sub.meta = meta;
        Some(sub)
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Download URL, `None` for local subscriptions.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn is_metadata_valid(&self) -> bool {
        self.metadata_valid
    }

    pub fn is_filters_valid(&self) -> bool {
        self.filters_valid
    }

    pub(crate) fn set_metadata_valid(&mut self, valid: bool) {
        self.metadata_valid = valid;
    }

    pub(crate) fn set_filters_valid(&mut self, valid: bool) {
        self.filters_valid = valid;
    }

    /// Refresh interval chosen for this instance, jitter included.
    pub fn update_interval_ms(&self) -> i64 {
        self.update_interval_ms
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Look up a metadata entry. Keys are case-insensitive.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.meta.insert(key.to_lowercase(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<String> {
        self.meta.remove(&key.to_lowercase())
    }

    /// All metadata pairs in key order.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.meta
    }

    /// Registry key of a local subscription, `None` for remote ones.
    pub fn local_key(&self) -> Option<&str> {
        match self.kind {
            SubscriptionKind::Local => self.meta(meta_keys::LOCAL_KEY),
            SubscriptionKind::Remote => None,
        }
    }

    pub fn title(&self) -> String {
        match (self.meta(meta_keys::TITLE), &self.url) {
            (Some(title), _) => title.to_string(),
            (None, Some(url)) => url.to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn version(&self) -> i64 {
        parse_long(self.meta.get(meta_keys::VERSION))
    }

    pub fn download_count(&self) -> i64 {
        parse_long(self.meta.get(meta_keys::DOWNLOAD_COUNT))
    }

    pub fn last_update(&self) -> i64 {
        parse_long(self.meta.get(meta_keys::UPDATE_TIMESTAMP))
    }

    pub fn last_tried_update(&self) -> i64 {
        parse_long(self.meta.get(meta_keys::TRIED_UPDATE_TIMESTAMP))
    }

    pub fn is_enabled(&self) -> bool {
        self.meta(meta_keys::ENABLED) == Some("true")
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.set_meta(meta_keys::ENABLED, enabled.to_string());
    }

    /// Download-only subscriptions are fetched on a fixed schedule but never
    /// contribute filters to the aggregate.
    pub fn is_download_only(&self) -> bool {
        self.meta(meta_keys::DOWNLOAD_ONLY) == Some("true")
    }

    pub fn set_download_only(&mut self, download_only: bool) {
        self.set_meta(meta_keys::DOWNLOAD_ONLY, download_only.to_string());
    }

    // =========================================================================
    // Freshness policy
    // =========================================================================

    /// Whether this subscription is due for a download now.
    pub fn should_update(&self, forced: bool) -> bool {
        self.should_update_at(forced, now_millis())
    }

    /// Whether this subscription is due for a download at `now` (epoch ms).
    pub fn should_update_at(&self, forced: bool, now: i64) -> bool {
        let last_update = self.last_update();
        let last_try = self.last_tried_update();

        if forced {
            return now - last_update.max(last_try) > MINIMAL_DOWNLOAD_INTERVAL_MS;
        }

        if last_try > last_update {
            return now - last_try > DOWNLOAD_RETRY_INTERVAL_MS;
        }

        let interval = if self.is_download_only() {
            DOWNLOAD_ONLY_INTERVAL_MS
        } else {
            self.update_interval_ms
        };
        now - last_update > interval
    }

    // =========================================================================
    // Filters
    // =========================================================================

    pub fn filters(&self) -> impl Iterator<Item = &String> {
        self.filters.iter()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub fn contains_filter(&self, filter: &str) -> bool {
        self.filters.contains(filter)
    }

    pub fn insert_filter(&mut self, filter: impl Into<String>) -> bool {
        self.filters.insert(filter.into())
    }

    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    /// Move the filters out, leaving the subscription empty.
    pub fn take_filters(&mut self) -> HashSet<String> {
        std::mem::take(&mut self.filters)
    }

    /// Content hash of the filters currently held in memory.
    pub fn filters_hash(&self) -> String {
        content_hash(self.filters.iter())
    }

    /// Classify one raw line of a filter list.
    ///
    /// `! key: value` lines update whitelisted metadata, `[...]` headers are
    /// skipped, every other non-empty line is a filter.
    pub fn parse_line(&mut self, input: &str) -> &mut Self {
        let line = input.trim();
        if line.is_empty() {
            return self;
        }

        if line.starts_with('!') {
            if let Some(colon) = line.find(':') {
                if colon > 2 {
                    let key = line[1..colon].trim().to_lowercase();
                    let value = line[colon + 1..].trim();
                    if !key.is_empty()
                        && !value.is_empty()
                        && meta_keys::DOWNLOADABLE.contains(&key.as_str())
                    {
                        self.meta.insert(key, value.to_string());
                    }
                }
            }
        } else if line.starts_with('[') {
            // header, e.g. [Adblock Plus 2.0]
        } else {
            self.filters.insert(line.to_string());
        }
        self
    }

    pub fn parse_text(&mut self, text: &str) -> &mut Self {
        for line in text.lines() {
            self.parse_line(line);
        }
        self
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    /// Apply the result of a download attempt at `now` (epoch ms).
    ///
    /// `headers` must use lower-case names. A `status` of `-1` stands for a
    /// transport failure. Returns `true` only when the filter set changed;
    /// the new filters are then held in memory until the caller persists them.
    pub fn apply_download_result(
        &mut self,
        status: i32,
        body: Option<&str>,
        headers: &HashMap<String, String>,
        now: i64,
    ) -> bool {
        if status == 304 {
            self.set_meta(meta_keys::UPDATE_TIMESTAMP, now.to_string());
            return false;
        }

        let body = match body {
            Some(body) if status == 200 && !body.is_empty() => body,
            _ => {
                self.set_meta(meta_keys::TRIED_UPDATE_TIMESTAMP, now.to_string());
                return false;
            }
        };

        self.set_meta(meta_keys::UPDATE_TIMESTAMP, now.to_string());
        self.set_meta(meta_keys::DOWNLOAD_COUNT, (self.download_count() + 1).to_string());
        for (header, key) in [
            ("etag", meta_keys::HTTP_ETAG),
            ("last-modified", meta_keys::HTTP_LAST_MODIFIED),
        ] {
            match headers.get(header) {
                Some(value) => self.set_meta(key, value.clone()),
                None => {
                    self.remove_meta(key);
                }
            }
        }

        if self.is_download_only() {
            return false;
        }

        self.clear_filters();
        self.parse_text(body);
        self.filters_valid = true;

        let new_hash = self.filters_hash();
        let changed = self.meta(meta_keys::FILTERS_HASH) != Some(new_hash.as_str());
        self.set_meta(meta_keys::FILTERS_HASH, new_hash);
        changed
    }
}

//! Subscription registry
//!
//! Owns every known subscription with its metadata resident in memory and
//! its filters on disk. Only the coordinator mutates the registry; requests
//! for downloads and rebuilds go out through [`RegistryHooks`].

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lk_compiler::optimize_filters;
use lk_core::record::{
    self, default_file_prefix, filters_path, metadata_path, qualified_file_prefix, FILTERS_EXTENSION,
};
use lk_core::types::{meta_keys, USER_EXCEPTIONS_TITLE, USER_FILTERS_TITLE};
use lk_core::{now_millis, Subscription, SubscriptionId};
use log::{debug, info, warn};
use serde::Serialize;
use url::Url;

use crate::aggregate::AggregateStore;
use crate::catalog::{Catalog, CatalogEntry};
use crate::config::AppInfo;
use crate::error::{EngineError, Result};
use crate::notification;
use crate::request::DownloadRequest;

/// Side effects the registry asks its owner to perform.
pub trait RegistryHooks {
    fn request_download(&mut self, request: DownloadRequest);
    fn request_rebuild(&mut self);
}

/// Read-only view of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub url: Option<String>,
    pub homepage: Option<String>,
    pub enabled: bool,
    pub download_only: bool,
    pub removable: bool,
    pub version: i64,
    pub last_update: i64,
    pub last_tried_update: i64,
    pub download_count: i64,
    pub metadata_valid: bool,
    pub filters_valid: bool,
}

/// Bundled texts used on first run.
#[derive(Debug, Clone, Default)]
pub struct BundledLists {
    pub user_filters: Option<String>,
    pub user_exceptions: Option<String>,
    /// Offline copy of the list chosen for the device language
    pub default_list: Option<String>,
}

/// What `bootstrap` created.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    /// Subscriptions registered after seeding, built-ins included
    pub registered: usize,
    /// Remote list chosen for the device language
    pub default_url: Url,
}

pub struct Registry {
    dir: PathBuf,
    app: AppInfo,
    catalog: Arc<Catalog>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    prefixes: HashMap<SubscriptionId, String>,
    was_uninitialized: bool,
}

impl Registry {
    /// Open the subscription directory and load all metadata records.
    pub fn open(dir: impl Into<PathBuf>, app: AppInfo, catalog: Arc<Catalog>) -> Result<Self> {
        let dir = dir.into();
        let was_uninitialized = !dir.exists();
        fs::create_dir_all(&dir).map_err(|e| EngineError::storage(&dir, e.to_string()))?;

        let mut registry = Self {
            dir,
            app,
            catalog,
            subscriptions: BTreeMap::new(),
            prefixes: HashMap::new(),
            was_uninitialized,
        };
        registry.scan()?;
        registry.ensure_local_subscriptions()?;

        info!(
            "Opened registry at {} with {} subscriptions{}",
            registry.dir.display(),
            registry.subscriptions.len(),
            if was_uninitialized { " (first run)" } else { "" }
        );
        Ok(registry)
    }

    fn scan(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|e| EngineError::storage(&self.dir, e.to_string()))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let prefix = match name.to_str().and_then(|n| n.strip_suffix(FILTERS_EXTENSION)) {
                Some(prefix) => prefix.to_string(),
                None => continue,
            };
            let meta = metadata_path(&self.dir, &prefix);
            if !meta.is_file() {
                continue;
            }

            let sub = match record::read_metadata(&meta) {
                Ok(sub) => sub,
                Err(e) => {
                    warn!("Failed to load {}: {}", meta.display(), e);
                    continue;
                }
            };
            if !sub.is_metadata_valid() {
                warn!("Metadata of '{}' failed verification, keeping what was read", sub.id());
            }
            if self.subscriptions.contains_key(sub.id()) {
                warn!("Duplicate record for '{}' in {}", sub.id(), meta.display());
                continue;
            }
            debug!("Loaded '{}' from {}", sub.id(), meta.display());
            self.prefixes.insert(sub.id().clone(), prefix);
            self.subscriptions.insert(sub.id().clone(), sub);
        }
        Ok(())
    }

    fn ensure_local_subscriptions(&mut self) -> Result<()> {
        for title in [USER_FILTERS_TITLE, USER_EXCEPTIONS_TITLE] {
            let id = SubscriptionId::local(title);
            if self.subscriptions.contains_key(&id) {
                continue;
            }
            let mut sub = Subscription::local(title);
            sub.set_enabled(true);
            sub.set_meta(meta_keys::UPDATE_TIMESTAMP, "0");
            let prefix = self.add_with_prefix(sub);
            // On first run bootstrap seeds and persists them.
            if !self.was_uninitialized {
                info!("Re-created missing local subscription '{}'", id);
                let keep_filters = filters_path(&self.dir, &prefix).is_file();
                self.write_subscription(&id, !keep_filters)?;
            }
        }
        Ok(())
    }

    fn assign_prefix(&mut self, sub: &Subscription) -> String {
        if let Some(prefix) = self.prefixes.get(sub.id()) {
            return prefix.clone();
        }
        let taken = |prefixes: &HashMap<SubscriptionId, String>, candidate: &str| {
            prefixes.values().any(|p| p == candidate)
        };

        let mut prefix = default_file_prefix(sub);
        if taken(&self.prefixes, &prefix) {
            prefix = qualified_file_prefix(sub);
        }
        let base = prefix.clone();
        let mut n = 2;
        while taken(&self.prefixes, &prefix) {
            prefix = format!("{}_{}", base, n);
            n += 1;
        }

        self.prefixes.insert(sub.id().clone(), prefix.clone());
        prefix
    }

    /// Write metadata, and filters first when `with_filters` is set.
    fn write_subscription(&mut self, id: &SubscriptionId, with_filters: bool) -> Result<()> {
        let sub = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let prefix = self
            .prefixes
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if with_filters {
            record::write_filters(&filters_path(&self.dir, prefix), sub)?;
        }
        record::write_metadata(&metadata_path(&self.dir, prefix), sub)?;
        Ok(())
    }

    /// Persist metadata and in-memory filters, then drop the filters.
    fn persist(&mut self, id: &SubscriptionId) -> Result<()> {
        let result = self.write_subscription(id, true);
        if let Some(sub) = self.subscriptions.get_mut(id) {
            sub.clear_filters();
        }
        result
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the subscription directory did not exist before `open`.
    pub fn was_uninitialized(&self) -> bool {
        self.was_uninitialized
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.subscriptions.contains_key(id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn is_enabled(&self, id: &SubscriptionId) -> bool {
        self.subscriptions.get(id).map_or(false, Subscription::is_enabled)
    }

    pub fn ids(&self) -> impl Iterator<Item = &SubscriptionId> {
        self.subscriptions.keys()
    }

    fn is_removable(&self, sub: &Subscription) -> bool {
        match sub.url() {
            Some(url) => !sub.is_download_only() && !self.catalog.contains(url),
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .values()
            .map(|sub| SubscriptionInfo {
                id: sub.id().to_string(),
                kind: sub.kind().to_string(),
                title: sub.title(),
                url: sub.url().map(Url::to_string),
                homepage: sub.meta("homepage").map(str::to_string),
                enabled: sub.is_enabled(),
                download_only: sub.is_download_only(),
                removable: self.is_removable(sub),
                version: sub.version(),
                last_update: sub.last_update(),
                last_tried_update: sub.last_tried_update(),
                download_count: sub.download_count(),
                metadata_valid: sub.is_metadata_valid(),
                filters_valid: sub.is_filters_valid(),
            })
            .collect()
    }

    /// Load the filters of one subscription from disk.
    pub fn load_filters(&mut self, id: &SubscriptionId) -> Result<Vec<String>> {
        let sub = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let prefix = self
            .prefixes
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        record::read_filters(&filters_path(&self.dir, prefix), sub)?;
        let mut filters: Vec<String> = sub.take_filters().into_iter().collect();
        filters.sort();
        Ok(filters)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Insert `sub` unless its id is known; returns the registered instance.
    pub fn add(&mut self, sub: Subscription) -> &mut Subscription {
        if !self.subscriptions.contains_key(sub.id()) {
            self.assign_prefix(&sub);
        }
        let id = sub.id().clone();
        self.subscriptions.entry(id).or_insert(sub)
    }

    fn add_with_prefix(&mut self, sub: Subscription) -> String {
        let prefix = self.assign_prefix(&sub);
        self.add(sub);
        prefix
    }

    fn download_request(&self, sub: &Subscription, allow_metered: bool) -> Option<DownloadRequest> {
        DownloadRequest::for_subscription(sub, &self.app, allow_metered)
    }

    /// Enable or disable a subscription. Returns whether anything changed.
    pub fn change_state(
        &mut self,
        id: &SubscriptionId,
        enabled: bool,
        hooks: &mut dyn RegistryHooks,
    ) -> Result<bool> {
        let sub = match self.subscriptions.get_mut(id) {
            Some(sub) => sub,
            None => {
                warn!("Ignoring state change of unknown subscription '{}'", id);
                return Ok(false);
            }
        };
        if sub.is_enabled() == enabled {
            return Ok(false);
        }
        sub.set_enabled(enabled);
        self.write_subscription(id, false)?;

        if enabled {
            if let Some(sub) = self.subscriptions.get(id) {
                if sub.should_update(true) {
                    if let Some(request) = self.download_request(sub, false) {
                        hooks.request_download(request);
                    }
                }
            }
        }
        hooks.request_rebuild();
        info!("{} '{}'", if enabled { "Enabled" } else { "Disabled" }, id);
        Ok(true)
    }

    /// Register a user supplied remote list. Returns false when it already
    /// exists.
    pub fn add_custom(&mut self, sub: Subscription, hooks: &mut dyn RegistryHooks) -> Result<bool> {
        if sub.url().is_none() {
            return Err(EngineError::invalid_input("url", "custom subscriptions need a url"));
        }
        if self.contains(sub.id()) {
            debug!("Custom subscription '{}' already registered", sub.id());
            return Ok(false);
        }
        let id = sub.id().clone();
        let enabled = sub.is_enabled();
        self.add(sub);
        self.persist(&id)?;

        if enabled {
            if let Some(request) = self.subscriptions.get(&id).and_then(|s| self.download_request(s, false)) {
                hooks.request_download(request);
            }
            hooks.request_rebuild();
        }
        info!("Added custom subscription '{}'", id);
        Ok(true)
    }

    /// Delete a custom subscription and its records. Returns whether it was
    /// enabled, in which case the aggregate needs a rebuild.
    pub fn remove(&mut self, id: &SubscriptionId) -> Result<bool> {
        let sub = self
            .subscriptions
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !self.is_removable(sub) {
            return Err(EngineError::NotRemovable(id.to_string()));
        }
        let was_enabled = sub.is_enabled();
        self.subscriptions.remove(id);

        if let Some(prefix) = self.prefixes.remove(id) {
            for path in [filters_path(&self.dir, &prefix), metadata_path(&self.dir, &prefix)] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(EngineError::storage(&path, e.to_string())),
                }
            }
        }
        info!("Removed subscription '{}'", id);
        Ok(was_enabled)
    }

    /// Apply a finished download. Returns whether the filters changed.
    pub fn apply_download(
        &mut self,
        id: &SubscriptionId,
        status: i32,
        body: Option<&str>,
        headers: &HashMap<String, String>,
        hooks: &mut dyn RegistryHooks,
    ) -> Result<bool> {
        let sub = match self.subscriptions.get_mut(id) {
            Some(sub) => sub,
            None => {
                debug!("Dropping download result of unknown subscription '{}'", id);
                return Ok(false);
            }
        };

        let changed = sub.apply_download_result(status, body, headers, now_millis());

        if sub.is_download_only() && status == 200 {
            if let Some(body) = body.filter(|b| !b.is_empty()) {
                let version = notification::payload_version(body);
                debug!("Notification payload version {}", version);
                sub.set_meta(meta_keys::VERSION, version);
                notification::store_payload(&self.dir, body)?;
            }
        }

        let result = self.write_subscription(id, changed);
        if let Some(sub) = self.subscriptions.get_mut(id) {
            sub.clear_filters();
        }
        result?;

        if changed {
            info!("Filters of '{}' changed", id);
            hooks.request_rebuild();
        } else {
            debug!("Download of '{}' finished with status {}, no filter change", id, status);
        }
        Ok(changed)
    }

    /// Request downloads for every enabled remote subscription that is due.
    /// Returns the number of requests.
    pub fn check_for_updates(
        &self,
        forced: bool,
        allow_metered: bool,
        hooks: &mut dyn RegistryHooks,
    ) -> usize {
        let mut requested = 0usize;
        for sub in self.subscriptions.values() {
            if !sub.is_enabled() || !sub.should_update(forced) {
                continue;
            }
            if let Some(request) = self.download_request(sub, allow_metered) {
                hooks.request_download(request);
                requested += 1;
            }
        }
        if requested > 0 {
            debug!("Requested {} downloads (forced: {})", requested, forced);
        }
        requested
    }

    /// Merge the filters of all enabled subscriptions into a new aggregate.
    pub fn rebuild_aggregate(&mut self, store: &AggregateStore, allowlist: &[String]) -> Result<PathBuf> {
        let mut filters = Vec::new();
        for (id, sub) in self.subscriptions.iter_mut() {
            if !sub.is_enabled() || sub.is_download_only() {
                continue;
            }
            let prefix = match self.prefixes.get(id) {
                Some(prefix) => prefix,
                None => continue,
            };
            debug!("Adding filters for '{}'", id);
            if let Err(e) = record::read_filters(&filters_path(&self.dir, prefix), sub) {
                warn!("Failed to read filters of '{}': {}", id, e);
            } else if !sub.is_filters_valid() {
                warn!("Filters of '{}' failed verification, using what was read", id);
            }
            filters.extend(sub.take_filters());
        }

        let stats = optimize_filters(&mut filters);
        info!(
            "Writing {} filters ({} duplicates, {} unsupported dropped)",
            stats.after, stats.deduped, stats.unsupported
        );
        store.write(&filters, allowlist)
    }

    // =========================================================================
    // First run and migration
    // =========================================================================

    /// Seed a fresh registry: local subscriptions, the notification channel
    /// and every catalog entry. Everything is persisted once at the end.
    pub fn bootstrap(
        &mut self,
        bundled: &BundledLists,
        language: &str,
        notification_url: &Url,
    ) -> Result<BootstrapReport> {
        for (title, text) in [
            (USER_FILTERS_TITLE, &bundled.user_filters),
            (USER_EXCEPTIONS_TITLE, &bundled.user_exceptions),
        ] {
            let sub = self.add(Subscription::local(title));
            if let Some(text) = text {
                sub.parse_text(text);
            }
            sub.set_meta(meta_keys::UPDATE_TIMESTAMP, "0");
            sub.set_enabled(true);
        }

        let notification = self.add(Subscription::remote(notification_url.clone()));
        notification.set_download_only(true);
        notification.set_enabled(true);

        let catalog = Arc::clone(&self.catalog);
        let default_url = catalog.choose_default(language);
        let mut seeded_default = false;
        for entry in catalog.entries() {
            let is_default = entry.url == default_url;
            let mut sub = catalog_subscription(entry);
            sub.set_enabled(entry.enabled_by_default || is_default);
            if is_default {
                seed_default(&mut sub, bundled);
                seeded_default = true;
            }
            self.add(sub);
        }
        if !seeded_default {
            let mut sub = Subscription::remote(default_url.clone());
            sub.set_enabled(true);
            seed_default(&mut sub, bundled);
            self.add(sub);
        }

        let ids: Vec<SubscriptionId> = self.subscriptions.keys().cloned().collect();
        for id in &ids {
            self.persist(id)?;
        }

        let registered = self.subscriptions.len();
        info!("Bootstrapped {} subscriptions, default list {}", registered, default_url);
        Ok(BootstrapReport {
            registered,
            default_url,
        })
    }

    /// Add catalog entries missing after an upgrade. Returns how many were
    /// added.
    pub fn merge_catalog_defaults(&mut self) -> Result<usize> {
        let catalog = Arc::clone(&self.catalog);
        let mut added = 0usize;
        for entry in catalog.entries() {
            if self.contains(&SubscriptionId::remote(&entry.url)) {
                continue;
            }
            let mut sub = catalog_subscription(entry);
            sub.set_enabled(entry.enabled_by_default);
            let id = sub.id().clone();
            self.add(sub);
            self.persist(&id)?;
            debug!("Added catalog subscription '{}'", id);
            added += 1;
        }
        if added > 0 {
            info!("Added {} catalog subscriptions after upgrade", added);
        }
        Ok(added)
    }
}

fn catalog_subscription(entry: &CatalogEntry) -> Subscription {
    let mut sub = Subscription::remote(entry.url.clone());
    sub.set_meta(meta_keys::TITLE, entry.title.clone());
    if let Some(homepage) = &entry.homepage {
        sub.set_meta("homepage", homepage.clone());
    }
    sub
}

fn seed_default(sub: &mut Subscription, bundled: &BundledLists) {
    if let Some(text) = &bundled.default_list {
        sub.parse_text(text);
        // Remote lists refresh on first check even when seeded.
        sub.set_meta(meta_keys::UPDATE_TIMESTAMP, "0");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        downloads: Vec<DownloadRequest>,
        rebuilds: usize,
    }

    impl RegistryHooks for Recorder {
        fn request_download(&mut self, request: DownloadRequest) {
            self.downloads.push(request);
        }

        fn request_rebuild(&mut self) {
            self.rebuilds += 1;
        }
    }

    const CATALOG: &str = r#"{
        "default_url": "https://lists.example/easylist.txt",
        "subscriptions": [
            {"title": "EasyList", "url": "https://lists.example/easylist.txt", "languages": ["en"], "complete": true},
            {"title": "Germany", "url": "https://lists.example/de.txt", "languages": ["de"], "complete": true},
            {"title": "Privacy", "url": "https://lists.example/privacy.txt"}
        ]
    }"#;

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::from_json(CATALOG).unwrap())
    }

    fn open(dir: &Path) -> Registry {
        Registry::open(dir.join("subscriptions"), AppInfo::default(), catalog()).unwrap()
    }

    fn id(raw: &str) -> SubscriptionId {
        SubscriptionId::from(raw)
    }

    fn notification_url() -> Url {
        Url::parse("https://notify.example/notification.json").unwrap()
    }

    fn custom(url: &str, enabled: bool) -> Subscription {
        let mut sub = Subscription::remote(Url::parse(url).unwrap());
        sub.set_enabled(enabled);
        sub
    }

    fn bundled() -> BundledLists {
        BundledLists {
            user_filters: Some("||mine.example^\n".to_string()),
            user_exceptions: Some("@@||ok.example^\n".to_string()),
            default_list: None,
        }
    }

    #[test]
    fn test_open_creates_locals() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        assert!(registry.was_uninitialized());
        assert!(registry.is_enabled(&id("user:__filters")));
        assert!(registry.is_enabled(&id("user:__exceptions")));
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let before = registry.len();

        let mut first = custom("https://x/list.txt", true);
        first.set_meta(meta_keys::TITLE, "first");
        registry.add(first);
        let mut second = custom("https://x/list.txt", false);
        second.set_meta(meta_keys::TITLE, "second");
        let kept = registry.add(second);

        assert_eq!(kept.title(), "first");
        assert_eq!(registry.len(), before + 1);
    }

    #[test]
    fn test_bootstrap_new_install() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let report = registry.bootstrap(&bundled(), "en-US", &notification_url()).unwrap();

        // 2 locals + notification + 3 catalog entries
        assert_eq!(registry.len(), 6);
        assert_eq!(report.registered, 6);
        assert_eq!(report.default_url.as_str(), "https://lists.example/easylist.txt");
        assert!(registry.is_enabled(&id("url:https://lists.example/easylist.txt")));
        assert!(!registry.is_enabled(&id("url:https://lists.example/de.txt")));
        assert!(!registry.is_enabled(&id("url:https://lists.example/privacy.txt")));

        let notification = registry.get(&id("url:https://notify.example/notification.json")).unwrap();
        assert!(notification.is_download_only());
        assert!(notification.is_enabled());

        // Everything is on disk
        let reopened = open(dir.path());
        assert!(!reopened.was_uninitialized());
        assert_eq!(reopened.len(), 6);
        assert!(reopened.list().iter().all(|info| info.metadata_valid));
    }

    #[test]
    fn test_bootstrap_picks_language_default() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut lists = bundled();
        lists.default_list = Some("||bundled.example^\n".to_string());
        let report = registry.bootstrap(&lists, "de", &notification_url()).unwrap();

        assert_eq!(report.default_url.as_str(), "https://lists.example/de.txt");
        assert!(registry.is_enabled(&id("url:https://lists.example/de.txt")));
        assert!(!registry.is_enabled(&id("url:https://lists.example/easylist.txt")));
        assert_eq!(
            registry.load_filters(&id("url:https://lists.example/de.txt")).unwrap(),
            vec!["||bundled.example^".to_string()]
        );
    }

    #[test]
    fn test_change_state_enable() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        registry.bootstrap(&bundled(), "en", &notification_url()).unwrap();
        let target = id("url:https://lists.example/privacy.txt");

        let mut hooks = Recorder::default();
        assert!(registry.change_state(&target, true, &mut hooks).unwrap());
        assert_eq!(hooks.downloads.len(), 1);
        assert_eq!(hooks.downloads[0].id, target);
        assert_eq!(hooks.rebuilds, 1);

        // Persisted immediately
        assert!(open(dir.path()).is_enabled(&target));

        // No-op when unchanged
        let mut hooks = Recorder::default();
        assert!(!registry.change_state(&target, true, &mut hooks).unwrap());
        assert!(hooks.downloads.is_empty());
        assert_eq!(hooks.rebuilds, 0);
    }

    #[test]
    fn test_change_state_disable_does_not_download() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        assert!(registry.change_state(&id("user:__filters"), false, &mut hooks).unwrap());
        assert!(hooks.downloads.is_empty());
        assert_eq!(hooks.rebuilds, 1);
        assert!(!registry.change_state(&id("url:https://unknown/"), true, &mut hooks).unwrap());
    }

    #[test]
    fn test_apply_download_not_modified() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        let target = id("url:https://x/list.txt");
        registry.add_custom(custom("https://x/list.txt", true), &mut hooks).unwrap();

        let mut hooks = Recorder::default();
        let changed = registry
            .apply_download(&target, 304, None, &HashMap::new(), &mut hooks)
            .unwrap();
        assert!(!changed);
        assert_eq!(hooks.rebuilds, 0);
        assert!(registry.get(&target).unwrap().last_update() > 0);
    }

    #[test]
    fn test_apply_download_changes_filters() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        let target = id("url:https://x/list.txt");
        registry.add_custom(custom("https://x/list.txt", true), &mut hooks).unwrap();

        let mut hooks = Recorder::default();
        let body = "[Adblock Plus 2.0]\n! Title: X\n||ads.example^\n";
        assert!(registry
            .apply_download(&target, 200, Some(body), &HashMap::new(), &mut hooks)
            .unwrap());
        assert_eq!(hooks.rebuilds, 1);
        assert_eq!(registry.get(&target).unwrap().filter_count(), 0);
        assert_eq!(registry.load_filters(&target).unwrap(), vec!["||ads.example^".to_string()]);

        // Same content again is not a delta
        let mut hooks = Recorder::default();
        assert!(!registry
            .apply_download(&target, 200, Some(body), &HashMap::new(), &mut hooks)
            .unwrap());
        assert_eq!(hooks.rebuilds, 0);
    }

    #[test]
    fn test_apply_download_failure_keeps_filters() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        let target = id("url:https://x/list.txt");
        registry.add_custom(custom("https://x/list.txt", true), &mut hooks).unwrap();
        registry
            .apply_download(&target, 200, Some("||ads.example^"), &HashMap::new(), &mut hooks)
            .unwrap();

        let mut hooks = Recorder::default();
        assert!(!registry
            .apply_download(&target, -1, None, &HashMap::new(), &mut hooks)
            .unwrap());
        let sub = registry.get(&target).unwrap();
        assert!(sub.last_tried_update() >= sub.last_update());
        assert_eq!(registry.load_filters(&target).unwrap(), vec!["||ads.example^".to_string()]);
    }

    #[test]
    fn test_notification_payload_stored() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        registry.bootstrap(&bundled(), "en", &notification_url()).unwrap();
        let target = id("url:https://notify.example/notification.json");

        let mut hooks = Recorder::default();
        let changed = registry
            .apply_download(&target, 200, Some(r#"{"version": "42"}"#), &HashMap::new(), &mut hooks)
            .unwrap();
        assert!(!changed);
        assert_eq!(hooks.rebuilds, 0);
        assert_eq!(registry.get(&target).unwrap().version(), 42);
        assert!(notification::load_payload(registry.dir()).is_some());
    }

    #[test]
    fn test_check_for_updates_only_enabled_and_due() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        registry.bootstrap(&bundled(), "en", &notification_url()).unwrap();

        let mut hooks = Recorder::default();
        let requested = registry.check_for_updates(false, false, &mut hooks);
        let ids: Vec<&str> = hooks.downloads.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(requested, 2);
        assert!(ids.contains(&"url:https://lists.example/easylist.txt"));
        assert!(ids.contains(&"url:https://notify.example/notification.json"));
        assert!(hooks.downloads.iter().any(|r| r.download_only));
    }

    #[test]
    fn test_rebuild_dedups_and_filters() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        for (url, body) in [
            ("https://x/a.txt", "ads.example^\n||$script\n##.banner\n"),
            ("https://x/b.txt", "ads.example^\n@@||$document\n"),
        ] {
            registry.add_custom(custom(url, true), &mut hooks).unwrap();
            let target = SubscriptionId::remote(&Url::parse(url).unwrap());
            registry
                .apply_download(&target, 200, Some(body), &HashMap::new(), &mut hooks)
                .unwrap();
        }
        registry.add_custom(custom("https://x/off.txt", false), &mut hooks).unwrap();
        registry
            .apply_download(&id("url:https://x/off.txt"), 200, Some("||off.example^"), &HashMap::new(), &mut hooks)
            .unwrap();

        let store = AggregateStore::open(dir.path().join("cache")).unwrap();
        let path = registry
            .rebuild_aggregate(&store, &["shop.example".to_string()])
            .unwrap();
        let text = fs::read_to_string(path).unwrap();

        assert_eq!(text.lines().filter(|l| *l == "ads.example^").count(), 1);
        assert!(text.contains("##.banner\n"));
        assert!(!text.contains("||$script"));
        assert!(!text.contains("@@||$document"));
        assert!(!text.contains("||off.example^"));
        assert!(text.ends_with("@@||shop.example^$document\n"));
    }

    #[test]
    fn test_remove_only_custom() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        registry.bootstrap(&bundled(), "en", &notification_url()).unwrap();
        let mut hooks = Recorder::default();
        registry.add_custom(custom("https://x/list.txt", true), &mut hooks).unwrap();

        assert!(matches!(
            registry.remove(&id("url:https://lists.example/easylist.txt")),
            Err(EngineError::NotRemovable(_))
        ));
        assert!(matches!(registry.remove(&id("user:__filters")), Err(EngineError::NotRemovable(_))));
        assert!(matches!(registry.remove(&id("url:https://nope/")), Err(EngineError::NotFound(_))));

        assert!(registry.remove(&id("url:https://x/list.txt")).unwrap());
        assert!(!open(dir.path()).contains(&id("url:https://x/list.txt")));
    }

    #[test]
    fn test_basename_collision_gets_distinct_files() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        for url in ["https://a.example/list.txt", "https://b.example/list.txt"] {
            registry.add_custom(custom(url, false), &mut hooks).unwrap();
        }
        let reopened = open(dir.path());
        assert!(reopened.contains(&id("url:https://a.example/list.txt")));
        assert!(reopened.contains(&id("url:https://b.example/list.txt")));
    }

    #[test]
    fn test_merge_catalog_defaults() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        assert_eq!(registry.merge_catalog_defaults().unwrap(), 3);
        assert_eq!(registry.merge_catalog_defaults().unwrap(), 0);
        assert!(!registry.is_enabled(&id("url:https://lists.example/privacy.txt")));
    }

    #[test]
    fn test_unreadable_record_skipped() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        registry.add_custom(custom("https://x/list.txt", true), &mut hooks).unwrap();

        fs::write(filters_path(registry.dir(), "url_bad.txt"), b"garbage").unwrap();
        fs::write(metadata_path(registry.dir(), "url_bad.txt"), [0x10, 0, 0, 0, 0xff, 0xff]).unwrap();
        // Filters without metadata are ignored
        fs::write(filters_path(registry.dir(), "url_orphan.txt"), b"").unwrap();

        let reopened = open(dir.path());
        assert_eq!(reopened.len(), 3);
        assert!(reopened.is_enabled(&id("url:https://x/list.txt")));
    }

    #[test]
    fn test_local_title_line_keeps_identity() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut lists = bundled();
        lists.user_filters = Some("! Title: My filters\n||mine.example^\n".to_string());
        registry.bootstrap(&lists, "en", &notification_url()).unwrap();
        let before: Vec<SubscriptionId> = registry.ids().cloned().collect();

        let mut reopened = open(dir.path());
        let after: Vec<SubscriptionId> = reopened.ids().cloned().collect();
        assert_eq!(before, after);

        let target = id("user:__filters");
        assert_eq!(reopened.get(&target).unwrap().title(), "My filters");
        assert_eq!(reopened.load_filters(&target).unwrap(), vec!["||mine.example^".to_string()]);
    }

    #[test]
    fn test_cut_metadata_record_still_loads() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let mut hooks = Recorder::default();
        registry
            .add_custom(custom("https://x.example/custom.txt", true), &mut hooks)
            .unwrap();

        let meta = metadata_path(registry.dir(), "url_custom.txt");
        let bytes = fs::read(&meta).unwrap();
        fs::write(&meta, &bytes[..bytes.len() - 8]).unwrap();

        let reopened = open(dir.path());
        let target = id("url:https://x.example/custom.txt");
        assert!(reopened.contains(&target));
        let info = reopened.list().into_iter().find(|i| i.id == target.as_str()).unwrap();
        assert!(!info.metadata_valid);
        assert!(info.enabled);
    }

    #[test]
    fn test_missing_local_recreated() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        registry.bootstrap(&bundled(), "en", &notification_url()).unwrap();
        let prefix_dir = registry.dir().to_path_buf();
        fs::remove_file(metadata_path(&prefix_dir, "user___exceptions")).unwrap();

        let mut reopened = open(dir.path());
        assert!(reopened.is_enabled(&id("user:__exceptions")));
        assert!(metadata_path(&prefix_dir, "user___exceptions").is_file());
        assert_eq!(
            reopened.load_filters(&id("user:__exceptions")).unwrap(),
            vec!["@@||ok.example^".to_string()]
        );
    }
}

//! Update coordinator
//!
//! One task owns every mutation of the registry. Callers and the downloader
//! talk to it through an event queue; it applies each event under the
//! registry lock, runs the periodic update check and rebuilds the aggregate
//! once mutations have settled for the debounce interval.
//!
//! ```text
//!   caller ──┐                       ┌── Downloader ── Fetcher
//!            ├─ EngineEvent ─> loop ─┤
//!   worker ──┘                       └── AggregateStore ── HostNotifier
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lk_compiler::normalize_site;
use lk_core::types::meta_keys;
use lk_core::{Subscription, SubscriptionId};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::aggregate::AggregateStore;
use crate::catalog::Catalog;
use crate::config::{EngineConfig, FirstRunMetered};
use crate::connectivity::Connectivity;
use crate::downloader::{Downloader, RetryPolicy};
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, EngineNotice};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::registry::{BundledLists, Registry, RegistryHooks, SubscriptionInfo};
use crate::request::DownloadRequest;
use crate::state::EngineState;

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
const NOTICE_CAPACITY: usize = 64;

// =============================================================================
// Collaborators
// =============================================================================

/// Receives every new aggregate. Called from the coordinator task.
pub trait HostNotifier: Send + Sync {
    fn aggregate_updated(&self, path: &Path);
}

/// Host notifier that only logs.
#[derive(Debug, Default)]
pub struct LogHost;

impl HostNotifier for LogHost {
    fn aggregate_updated(&self, path: &Path) {
        info!("Aggregate ready at {}", path.display());
    }
}

/// Platform job scheduler for download-only subscriptions. Results are
/// handed back through [`Engine::report_download`].
pub trait FetchScheduler: Send + Sync {
    fn schedule(&self, request: DownloadRequest);
}

pub struct Collaborators {
    pub connectivity: Arc<dyn Connectivity>,
    pub fetcher: Arc<dyn Fetcher>,
    pub host: Arc<dyn HostNotifier>,
    pub scheduler: Option<Arc<dyn FetchScheduler>>,
}

impl Collaborators {
    /// reqwest fetcher, logging host, no scheduler.
    pub fn http(config: &EngineConfig, connectivity: Arc<dyn Connectivity>) -> Result<Self> {
        Ok(Self {
            connectivity,
            fetcher: Arc::new(HttpFetcher::new(&config.http)?),
            host: Arc::new(LogHost),
            scheduler: None,
        })
    }
}

// =============================================================================
// Coordinator loop
// =============================================================================

/// Metered override for the first update pass after bootstrap.
#[derive(Debug, Clone)]
struct FirstPass {
    policy: FirstRunMetered,
    default_id: SubscriptionId,
}

impl FirstPass {
    fn allows_metered(&self, id: &SubscriptionId) -> bool {
        match self.policy {
            FirstRunMetered::Off => false,
            FirstRunMetered::DefaultListOnly => *id == self.default_id,
            FirstRunMetered::AllSubscriptions => true,
        }
    }
}

struct LoopHooks<'a> {
    downloader: &'a Downloader,
    scheduler: Option<&'a dyn FetchScheduler>,
    first_pass: Option<&'a FirstPass>,
    rebuild: bool,
}

impl RegistryHooks for LoopHooks<'_> {
    fn request_download(&mut self, mut request: DownloadRequest) {
        if self.first_pass.map_or(false, |pass| pass.allows_metered(&request.id)) {
            request.allow_metered = true;
        }
        match self.scheduler {
            Some(scheduler) if request.download_only => {
                debug!("Scheduling download-only '{}'", request.id);
                scheduler.schedule(request);
            }
            _ => {
                self.downloader.enqueue(request);
            }
        }
    }

    fn request_rebuild(&mut self) {
        self.rebuild = true;
    }
}

struct Timers {
    next_check: Instant,
    rebuild_at: Option<Instant>,
    first_pass: Option<FirstPass>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    config: EngineConfig,
    registry: Mutex<Registry>,
    state: Mutex<EngineState>,
    store: AggregateStore,
    downloader: Arc<Downloader>,
    events: mpsc::UnboundedSender<EngineEvent>,
    notices: broadcast::Sender<EngineNotice>,
    host: Arc<dyn HostNotifier>,
    scheduler: Option<Arc<dyn FetchScheduler>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the registry, seed it on first run and spawn the downloader and
    /// coordinator tasks. Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        let catalog = match &config.catalog_path {
            Some(path) => Catalog::load(path)?,
            None => Catalog::bundled()?,
        };
        fs::create_dir_all(&config.data_dir).map_err(|e| EngineError::storage(&config.data_dir, e.to_string()))?;

        let mut registry = Registry::open(config.subscriptions_dir(), config.app.clone(), Arc::new(catalog))?;
        let mut state = EngineState::load(&config.state_path());

        let mut first_pass = None;
        if registry.was_uninitialized() {
            let notification_url = Url::parse(&config.notification_url)
                .map_err(|e| EngineError::invalid_input("notification_url", e.to_string()))?;
            let bundled = BundledLists {
                user_filters: read_bundled(config.user_filters_path.as_deref())?,
                user_exceptions: read_bundled(config.user_exceptions_path.as_deref())?,
                default_list: read_bundled(config.default_list_path.as_deref())?,
            };
            let report = registry.bootstrap(&bundled, &config.language, &notification_url)?;
            first_pass = Some(FirstPass {
                policy: config.first_run_metered,
                default_id: SubscriptionId::remote(&report.default_url),
            });
            // A new install has no aggregate worth keeping.
            state.active_aggregate = None;
        } else if state.previous_version.as_deref() != Some(ENGINE_VERSION) {
            info!(
                "Engine upgraded from {} to {}",
                state.previous_version.as_deref().unwrap_or("unknown"),
                ENGINE_VERSION
            );
            registry.merge_catalog_defaults()?;
        }
        state.previous_version = Some(ENGINE_VERSION.to_string());

        let store = AggregateStore::open(&config.cache_dir)?;
        store.ensure_placeholder()?;
        if state.active_aggregate.as_deref().map_or(false, |path| !path.is_file()) {
            warn!("Active aggregate is gone, a rebuild will replace it");
            state.active_aggregate = None;
        }
        state.save(&config.state_path())?;

        let (events, rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let downloader = Downloader::new(
            &config.downloader,
            RetryPolicy::from_config(&config.http),
            collaborators.fetcher,
            collaborators.connectivity,
            events.clone(),
        );

        let initial_delay = Duration::from_millis(config.initial_check_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        let now = Instant::now();
        let timers = Timers {
            next_check: now + initial_delay.mul_f64(1.0 + jitter),
            rebuild_at: state.active_aggregate.is_none().then_some(now),
            first_pass,
        };

        let engine = Arc::new(Self {
            config,
            registry: Mutex::new(registry),
            state: Mutex::new(state),
            store,
            downloader,
            events,
            notices,
            host: collaborators.host,
            scheduler: collaborators.scheduler,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let worker = engine.downloader.start();
        let coordinator = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(rx, timers).await })
        };
        engine.tasks.lock().extend([worker, coordinator]);

        info!("Engine started with {} subscriptions", engine.registry.lock().len());
        Ok(engine)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<EngineEvent>, mut timers: Timers) {
        let poll = self.config.event_poll();
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = tokio::time::timeout(poll, rx.recv()) => match received {
                    Ok(Some(event)) => Some(event),
                    Ok(None) => break,
                    Err(_) => None,
                },
            };

            let mut hooks = LoopHooks {
                downloader: &self.downloader,
                scheduler: self.scheduler.as_deref(),
                first_pass: timers.first_pass.as_ref(),
                rebuild: false,
            };
            let mut checked = false;
            {
                let mut registry = self.registry.lock();
                if let Some(event) = event {
                    self.handle_event(&mut registry, event, &mut hooks);
                }
                if Instant::now() >= timers.next_check {
                    registry.check_for_updates(false, false, &mut hooks);
                    checked = true;
                }
            }
            let rebuild = hooks.rebuild;

            let now = Instant::now();
            if checked {
                timers.next_check = now + self.config.update_check_interval();
                timers.first_pass = None;
            }
            if rebuild {
                timers.rebuild_at = Some(now + self.config.rebuild_debounce());
            }
            if timers.rebuild_at.map_or(false, |at| now >= at) {
                timers.rebuild_at = None;
                self.rebuild();
            }
        }
        info!("Coordinator stopped");
    }

    fn handle_event(&self, registry: &mut Registry, event: EngineEvent, hooks: &mut LoopHooks<'_>) {
        let result = match event {
            EngineEvent::ChangeEnabledState { id, enabled } => registry.change_state(&id, enabled, hooks).map(drop),
            EngineEvent::DownloadFinished {
                id,
                status,
                body,
                headers,
            } => registry
                .apply_download(&id, status, body.as_deref(), &headers, hooks)
                .map(drop),
            EngineEvent::ForceUpdate { allow_metered } => {
                let requested = registry.check_for_updates(true, allow_metered, hooks);
                info!("Forced update requested {} downloads", requested);
                Ok(())
            }
            EngineEvent::AddCustom { subscription } => registry.add_custom(subscription, hooks).map(drop),
            EngineEvent::RemoveCustom { id } => registry.remove(&id).map(|was_enabled| {
                if was_enabled {
                    hooks.request_rebuild();
                }
            }),
            EngineEvent::AllowlistChanged { host, allowed } => {
                let mut state = self.state.lock();
                let changed = if allowed {
                    state.allowlist.insert(host.clone())
                } else {
                    state.allowlist.remove(&host)
                };
                if changed {
                    info!("{} '{}'", if allowed { "Allowlisted" } else { "Removed from allowlist" }, host);
                    hooks.request_rebuild();
                    state.save(&self.config.state_path())
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            warn!("Failed to apply event: {}", e);
        }
    }

    fn rebuild(&self) {
        let allowlist = self.state.lock().allowlist_vec();
        let result = self.registry.lock().rebuild_aggregate(&self.store, &allowlist);
        let path = match result {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to rebuild aggregate: {}", e);
                return;
            }
        };

        {
            let mut state = self.state.lock();
            state.active_aggregate = Some(path.clone());
            if let Err(e) = state.save(&self.config.state_path()) {
                warn!("Failed to save engine state: {}", e);
            }
        }
        match self.store.cleanup(&path) {
            Ok(0) => {}
            Ok(removed) => debug!("Deleted {} old aggregates", removed),
            Err(e) => warn!("Failed to clean up aggregates: {}", e),
        }

        self.host.aggregate_updated(&path);
        // No receivers is fine.
        let _ = self.notices.send(EngineNotice::UpdateApplied { aggregate: path });
    }

    fn send(&self, event: EngineEvent) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        self.events.send(event).map_err(|_| EngineError::Shutdown)
    }

    /// Tell UI listeners a request was accepted. No receivers is fine.
    fn announce(&self, enabled: bool) {
        let _ = self.notices.send(EngineNotice::UpdateRequested { enabled });
    }

    fn ensure_known(&self, id: &SubscriptionId) -> Result<()> {
        if self.registry.lock().contains(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn request_enable(&self, id: &SubscriptionId) -> Result<()> {
        self.change_state(id, true)
    }

    pub fn request_disable(&self, id: &SubscriptionId) -> Result<()> {
        self.change_state(id, false)
    }

    pub fn change_state(&self, id: &SubscriptionId, enabled: bool) -> Result<()> {
        self.ensure_known(id)?;
        self.send(EngineEvent::ChangeEnabledState {
            id: id.clone(),
            enabled,
        })?;
        self.announce(enabled);
        Ok(())
    }

    /// Download every enabled subscription not fetched in the last minutes.
    pub fn force_update(&self, allow_metered: bool) -> Result<()> {
        self.send(EngineEvent::ForceUpdate { allow_metered })?;
        self.announce(true);
        Ok(())
    }

    /// Register and enable a remote list. Returns its id.
    pub fn add_custom(&self, url: &str, title: Option<&str>) -> Result<SubscriptionId> {
        let url = Url::parse(url.trim()).map_err(|e| EngineError::invalid_input("url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::invalid_input("url", format!("unsupported scheme '{}'", url.scheme())));
        }

        let mut subscription = Subscription::remote(url);
        if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
            subscription.set_meta(meta_keys::TITLE, title);
        }
        subscription.set_enabled(true);
        let id = subscription.id().clone();
        self.send(EngineEvent::AddCustom { subscription })?;
        self.announce(true);
        Ok(id)
    }

    pub fn remove_custom(&self, id: &SubscriptionId) -> Result<()> {
        self.ensure_known(id)?;
        self.send(EngineEvent::RemoveCustom { id: id.clone() })?;
        self.announce(false);
        Ok(())
    }

    /// Exempt a website from blocking. Returns the normalized host.
    pub fn allow_site(&self, site: &str) -> Result<String> {
        self.change_allowlist(site, true)
    }

    pub fn disallow_site(&self, site: &str) -> Result<String> {
        self.change_allowlist(site, false)
    }

    fn change_allowlist(&self, site: &str, allowed: bool) -> Result<String> {
        let host = normalize_site(site).ok_or_else(|| EngineError::invalid_input("site", format!("'{}' has no host", site)))?;
        self.send(EngineEvent::AllowlistChanged {
            host: host.clone(),
            allowed,
        })?;
        self.announce(!allowed);
        Ok(host)
    }

    /// Hand back the result of a download performed by a [`FetchScheduler`].
    pub fn report_download(
        &self,
        id: &SubscriptionId,
        status: i32,
        body: Option<String>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        self.send(EngineEvent::DownloadFinished {
            id: id.clone(),
            status,
            body,
            headers,
        })
    }

    /// Wake a downloader that paused for lack of network.
    pub fn connectivity_changed(&self) {
        self.downloader.connectivity_changed();
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.lock().list()
    }

    pub fn is_enabled(&self, id: &SubscriptionId) -> bool {
        self.registry.lock().is_enabled(id)
    }

    /// The file the host should load: the active aggregate, or the
    /// header-only placeholder before the first rebuild.
    pub fn current_aggregate(&self) -> PathBuf {
        let active = self.state.lock().active_aggregate.clone();
        self.store.current_or_placeholder(active.as_deref())
    }

    pub fn allowlist(&self) -> Vec<String> {
        self.state.lock().allowlist_vec()
    }

    pub fn pending_downloads(&self) -> usize {
        self.downloader.pending_count()
    }

    /// Notices for UI listeners. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop both tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.downloader.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }
}

fn read_bundled(path: Option<&Path>) -> Result<Option<String>> {
    match path {
        Some(path) => fs::read_to_string(path)
            .map(Some)
            .map_err(|e| EngineError::storage(path, e.to_string())),
        None => Ok(None),
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use lk_core::SubscriptionId;
use lk_engine::{
    Collaborators, Engine, EngineConfig, EngineNotice, NetworkMonitor, NetworkState, SubscriptionInfo,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

/// A running engine for the duration of one command.
pub struct Session {
    engine: Arc<Engine>,
    notices: broadcast::Receiver<EngineNotice>,
}

impl Session {
    pub fn start(config: EngineConfig, metered: bool) -> Result<Self, String> {
        let network = if metered {
            NetworkState::Metered
        } else {
            NetworkState::Unmetered
        };
        let monitor = NetworkMonitor::new(network, config.update_policy);
        let collaborators =
            Collaborators::http(&config, Arc::new(monitor)).map_err(|e| format!("Failed to set up HTTP: {}", e))?;
        let engine = Engine::start(config, collaborators).map_err(|e| format!("Failed to start engine: {}", e))?;
        let notices = engine.subscribe();
        Ok(Self { engine, notices })
    }

    pub async fn stop(self) {
        self.engine.shutdown().await;
    }

    /// Wait until the engine is quiet: no download pending and, when
    /// `expect_rebuild` is set, at least one new aggregate applied.
    async fn settle(&mut self, expect_rebuild: bool, wait: Duration) -> Option<PathBuf> {
        let deadline = Instant::now() + wait;
        let quiet = self.engine.config().rebuild_debounce() + Duration::from_secs(1);
        let mut applied = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Gave up waiting after {}s", wait.as_secs());
                break;
            }
            match tokio::time::timeout(quiet.min(remaining), self.notices.recv()).await {
                Ok(Ok(EngineNotice::UpdateApplied { aggregate })) => applied = Some(aggregate),
                Ok(Ok(EngineNotice::UpdateRequested { .. })) | Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => {
                    if self.engine.pending_downloads() == 0 && (applied.is_some() || !expect_rebuild) {
                        break;
                    }
                }
            }
        }
        applied
    }

    fn report(applied: Option<PathBuf>) {
        if let Some(path) = applied {
            println!("Aggregate: {}", path.display());
        }
    }

    pub async fn cmd_run(&mut self) -> Result<(), String> {
        let current = self.engine.current_aggregate();
        println!("Engine running, serving {}", current.display());
        println!("Press Ctrl-C to stop");

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(|e| format!("Failed to listen for Ctrl-C: {}", e))?;
                    break;
                }
                notice = self.notices.recv() => match notice {
                    Ok(EngineNotice::UpdateRequested { enabled }) => {
                        println!("Update requested ({})", if enabled { "enable" } else { "disable" });
                    }
                    Ok(EngineNotice::UpdateApplied { aggregate }) => {
                        println!("Aggregate updated: {}", aggregate.display());
                    }
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} notices", missed),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    pub fn cmd_list(&self, json: bool) -> Result<(), String> {
        let subscriptions = self.engine.subscriptions();
        if json {
            let text = serde_json::to_string_pretty(&subscriptions).map_err(|e| e.to_string())?;
            println!("{}", text);
            return Ok(());
        }

        println!("{} subscriptions", subscriptions.len());
        for info in &subscriptions {
            println!("  {}", format_info(info));
        }
        Ok(())
    }

    pub async fn cmd_change_state(&mut self, id: &str, enabled: bool, wait: Duration) -> Result<(), String> {
        let id = SubscriptionId::from_raw(id);
        if self.engine.is_enabled(&id) == enabled {
            println!("'{}' is already {}", id, if enabled { "enabled" } else { "disabled" });
            return Ok(());
        }
        self.engine.change_state(&id, enabled).map_err(|e| e.to_string())?;
        Self::report(self.settle(true, wait).await);
        println!("{} '{}'", if enabled { "Enabled" } else { "Disabled" }, id);
        Ok(())
    }

    pub async fn cmd_add(&mut self, url: &str, title: Option<&str>, wait: Duration) -> Result<(), String> {
        let id = self.engine.add_custom(url, title).map_err(|e| e.to_string())?;
        Self::report(self.settle(true, wait).await);
        println!("Added '{}'", id);
        Ok(())
    }

    pub async fn cmd_remove(&mut self, id: &str, wait: Duration) -> Result<(), String> {
        let id = SubscriptionId::from_raw(id);
        let was_enabled = self.engine.is_enabled(&id);
        self.engine.remove_custom(&id).map_err(|e| e.to_string())?;
        Self::report(self.settle(was_enabled, wait).await);
        if self.engine.subscriptions().iter().any(|info| info.id == id.as_str()) {
            return Err(format!("'{}' could not be removed, see the log", id));
        }
        println!("Removed '{}'", id);
        Ok(())
    }

    pub async fn cmd_update(&mut self, allow_metered: bool, wait: Duration) -> Result<(), String> {
        self.engine.force_update(allow_metered).map_err(|e| e.to_string())?;
        Self::report(self.settle(false, wait).await);
        let pending = self.engine.pending_downloads();
        if pending > 0 {
            println!("{} downloads still pending", pending);
        } else {
            println!("Update finished");
        }
        Ok(())
    }

    pub async fn cmd_allowlist(&mut self, site: &str, allowed: bool, wait: Duration) -> Result<(), String> {
        let listed = self.engine.allowlist();
        let host = if allowed {
            self.engine.allow_site(site)
        } else {
            self.engine.disallow_site(site)
        }
        .map_err(|e| e.to_string())?;

        if listed.contains(&host) == allowed {
            println!("'{}' is already {}", host, if allowed { "allowlisted" } else { "blocked" });
            return Ok(());
        }
        Self::report(self.settle(true, wait).await);
        println!("{} '{}'", if allowed { "Allowlisted" } else { "Removed from allowlist" }, host);
        Ok(())
    }
}

fn format_info(info: &SubscriptionInfo) -> String {
    let mut flags = Vec::new();
    if info.download_only {
        flags.push("download-only");
    }
    if !info.metadata_valid || !info.filters_valid {
        flags.push("corrupt");
    }
    if info.removable {
        flags.push("custom");
    }
    format!(
        "[{}] {} ({}){}",
        if info.enabled { "x" } else { " " },
        info.title,
        info.id,
        if flags.is_empty() {
            String::new()
        } else {
            format!(" {}", flags.join(", "))
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(enabled: bool, removable: bool) -> SubscriptionInfo {
        SubscriptionInfo {
            id: "url:https://x/list.txt".to_string(),
            kind: "remote".to_string(),
            title: "X".to_string(),
            url: Some("https://x/list.txt".to_string()),
            homepage: None,
            enabled,
            download_only: false,
            removable,
            version: 0,
            last_update: 0,
            last_tried_update: 0,
            download_count: 0,
            metadata_valid: true,
            filters_valid: true,
        }
    }

    #[test]
    fn test_format_info() {
        assert_eq!(format_info(&info(true, false)), "[x] X (url:https://x/list.txt)");
        assert_eq!(format_info(&info(false, true)), "[ ] X (url:https://x/list.txt) custom");
    }
}

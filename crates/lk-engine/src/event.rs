//! Coordinator events and outward notices

use std::collections::HashMap;
use std::path::PathBuf;

use lk_core::{Subscription, SubscriptionId};

/// Work items consumed by the coordinator loop.
#[derive(Debug)]
pub enum EngineEvent {
    ChangeEnabledState {
        id: SubscriptionId,
        enabled: bool,
    },
    /// `status` is the HTTP status, or -1 when the transfer failed
    DownloadFinished {
        id: SubscriptionId,
        status: i32,
        body: Option<String>,
        headers: HashMap<String, String>,
    },
    ForceUpdate {
        allow_metered: bool,
    },
    AddCustom {
        subscription: Subscription,
    },
    RemoveCustom {
        id: SubscriptionId,
    },
    AllowlistChanged {
        host: String,
        allowed: bool,
    },
}

/// Progress notices for UI listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// A request was accepted and an update will follow. `enabled` is true
    /// when the request adds blocking (enable, add, forced update, disallow)
    /// and false when it removes blocking (disable, remove, allow).
    UpdateRequested { enabled: bool },
    /// A new aggregate is active
    UpdateApplied { aggregate: PathBuf },
}

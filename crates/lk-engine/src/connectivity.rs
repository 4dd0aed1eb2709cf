//! Network availability policy

use parking_lot::RwLock;

use crate::config::UpdatePolicy;

/// Answers whether a download may start right now.
pub trait Connectivity: Send + Sync {
    fn can_fetch_now(&self, allow_metered: bool) -> bool;
}

/// Current network as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Offline,
    Unmetered,
    Metered,
}

/// Connectivity fed by host network callbacks.
#[derive(Debug)]
pub struct NetworkMonitor {
    state: RwLock<NetworkState>,
    policy: RwLock<UpdatePolicy>,
}

impl NetworkMonitor {
    pub fn new(state: NetworkState, policy: UpdatePolicy) -> Self {
        Self {
            state: RwLock::new(state),
            policy: RwLock::new(policy),
        }
    }

    pub fn set_state(&self, state: NetworkState) {
        *self.state.write() = state;
    }

    pub fn state(&self) -> NetworkState {
        *self.state.read()
    }

    pub fn set_policy(&self, policy: UpdatePolicy) {
        *self.policy.write() = policy;
    }
}

impl Connectivity for NetworkMonitor {
    fn can_fetch_now(&self, allow_metered: bool) -> bool {
        match self.state() {
            NetworkState::Offline => false,
            NetworkState::Unmetered => true,
            NetworkState::Metered => allow_metered || *self.policy.read() == UpdatePolicy::Always,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_never_fetches() {
        let monitor = NetworkMonitor::new(NetworkState::Offline, UpdatePolicy::Always);
        assert!(!monitor.can_fetch_now(true));
        assert!(!monitor.can_fetch_now(false));
    }

    #[test]
    fn test_wifi_only_policy() {
        let monitor = NetworkMonitor::new(NetworkState::Metered, UpdatePolicy::WifiOnly);
        assert!(!monitor.can_fetch_now(false));
        assert!(monitor.can_fetch_now(true));

        monitor.set_state(NetworkState::Unmetered);
        assert!(monitor.can_fetch_now(false));
    }

    #[test]
    fn test_always_policy() {
        let monitor = NetworkMonitor::new(NetworkState::Metered, UpdatePolicy::WifiOnly);
        monitor.set_policy(UpdatePolicy::Always);
        assert!(monitor.can_fetch_now(false));
    }
}

//! Persistent engine state (`engine_state.json`)

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineState {
    /// Aggregate last handed to the host
    pub active_aggregate: Option<PathBuf>,
    /// Engine version that wrote this state
    pub previous_version: Option<String>,
    /// Hosts exempted from blocking
    pub allowlist: BTreeSet<String>,
}

impl EngineState {
    /// Load the state. A missing or unreadable file yields the default state.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&text) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Ignoring unreadable engine state {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::storage(path, e.to_string()))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(|e| EngineError::storage(&tmp, e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| EngineError::storage(path, e.to_string()))?;
        Ok(())
    }

    pub fn allowlist_vec(&self) -> Vec<String> {
        self.allowlist.iter().cloned().collect()
    }
}

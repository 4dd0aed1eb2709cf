//! Notification channel payload
//!
//! The notification subscription is download-only: its JSON payload is kept
//! next to the subscription records and only its version is tracked.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{EngineError, Result};

pub const NOTIFICATION_FILE: &str = "notification.json";

/// The payload's `version` field, `"0"` when absent or unparsable.
pub fn payload_version(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("version") {
            Some(Value::String(version)) => version.clone(),
            Some(Value::Number(version)) => version.to_string(),
            _ => "0".to_string(),
        },
        _ => "0".to_string(),
    }
}

pub fn store_payload(dir: &Path, body: &str) -> Result<PathBuf> {
    let path = dir.join(NOTIFICATION_FILE);
    fs::write(&path, body).map_err(|e| EngineError::storage(&path, e.to_string()))?;
    Ok(path)
}

pub fn load_payload(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join(NOTIFICATION_FILE)).ok()
}

//! Aggregate file store
//!
//! Every rebuild writes a freshly named `tmp-<n>.txt` so the host can keep
//! reading the previous file until it is told about the new one.

use std::fs;
use std::path::{Path, PathBuf};

use lk_compiler::{write_aggregate, write_placeholder};
use rand::Rng;

use crate::error::{EngineError, Result};

/// Header-only file served before the first rebuild.
pub const PLACEHOLDER_NAME: &str = "empty.txt";

const AGGREGATE_PREFIX: &str = "tmp-";
const AGGREGATE_SUFFIX: &str = ".txt";

#[derive(Debug, Clone)]
pub struct AggregateStore {
    dir: PathBuf,
}

impl AggregateStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EngineError::storage(&dir, e.to_string()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn placeholder_path(&self) -> PathBuf {
        self.dir.join(PLACEHOLDER_NAME)
    }

    /// Create the placeholder if it does not exist yet.
    pub fn ensure_placeholder(&self) -> Result<PathBuf> {
        let path = self.placeholder_path();
        if !path.exists() {
            write_placeholder(&path)?;
        }
        Ok(path)
    }

    fn next_path(&self) -> PathBuf {
        let mut rng = rand::thread_rng();
        loop {
            let n: u32 = rng.gen_range(0..100_000_000);
            let path = self
                .dir
                .join(format!("{}{}{}", AGGREGATE_PREFIX, n, AGGREGATE_SUFFIX));
            if !path.exists() {
                return path;
            }
        }
    }

    /// Write a new aggregate and return its path.
    pub fn write(&self, filters: &[String], allowlist: &[String]) -> Result<PathBuf> {
        let path = self.next_path();
        log::debug!("Writing {} filters to {}", filters.len(), path.display());
        write_aggregate(&path, filters, allowlist)?;
        Ok(path)
    }

    /// The active aggregate when it still exists, the placeholder path
    /// otherwise. Never writes; the placeholder is created at startup.
    pub fn current_or_placeholder(&self, active: Option<&Path>) -> PathBuf {
        match active {
            Some(path) if path.is_file() => path.to_path_buf(),
            _ => self.placeholder_path(),
        }
    }

    /// Delete every aggregate except `active` and the placeholder.
    pub fn cleanup(&self, active: &Path) -> Result<usize> {
        let entries = fs::read_dir(&self.dir).map_err(|e| EngineError::storage(&self.dir, e.to_string()))?;
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_aggregate = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| {
                    name.starts_with(AGGREGATE_PREFIX) && name.ends_with(AGGREGATE_SUFFIX)
                });
            if !is_aggregate || path == active {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to delete old aggregate {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lk_compiler::AGGREGATE_HEADER;
    use tempfile::tempdir;

    #[test]
    fn test_placeholder_when_nothing_active() {
        let dir = tempdir().unwrap();
        let store = AggregateStore::open(dir.path().join("cache")).unwrap();
        store.ensure_placeholder().unwrap();
        let path = store.current_or_placeholder(None);
        assert_eq!(path, store.placeholder_path());
        assert_eq!(fs::read_to_string(&path).unwrap(), AGGREGATE_HEADER);

        let missing = dir.path().join("cache").join("tmp-1.txt");
        assert_eq!(store.current_or_placeholder(Some(&missing)), store.placeholder_path());
    }

    #[test]
    fn test_current_does_not_write() {
        let dir = tempdir().unwrap();
        let store = AggregateStore::open(dir.path()).unwrap();
        let path = store.current_or_placeholder(None);
        assert_eq!(path, store.placeholder_path());
        assert!(!path.exists());
    }

    #[test]
    fn test_write_uses_fresh_names() {
        let dir = tempdir().unwrap();
        let store = AggregateStore::open(dir.path()).unwrap();
        let first = store.write(&["||a.example^".to_string()], &[]).unwrap();
        let second = store.write(&["||b.example^".to_string()], &[]).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.current_or_placeholder(Some(&second)), second);
    }

    #[test]
    fn test_cleanup_keeps_active_and_placeholder() {
        let dir = tempdir().unwrap();
        let store = AggregateStore::open(dir.path()).unwrap();
        let placeholder = store.ensure_placeholder().unwrap();
        let old = store.write(&[], &[]).unwrap();
        let active = store.write(&[], &[]).unwrap();
        fs::write(dir.path().join("notes.md"), "keep").unwrap();

        assert_eq!(store.cleanup(&active).unwrap(), 1);
        assert!(!old.exists());
        assert!(active.exists());
        assert!(placeholder.exists());
        assert!(dir.path().join("notes.md").exists());
    }
}

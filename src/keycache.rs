//! Persisted set of market hash names worth revisiting between full
//! refreshes.
//!
//! A full refresh replaces the whole set with the keys of its published
//! result set; incremental refreshes read it to decide which buy-side items
//! still matter. Any filter-parameter change empties it, forcing the next
//! cycle to run full.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::StoreError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    keys: Vec<String>,
    last_built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CacheState {
    keys: HashSet<String>,
    last_built_at: Option<DateTime<Utc>>,
}

pub struct HashNameCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

impl HashNameCache {
    /// Loads the cache from `path`, starting empty if the file is missing
    /// or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(file) => {
                    info!(keys = file.keys.len(), path = %path.display(), "📂 Hash name cache loaded");
                    CacheState {
                        keys: file.keys.into_iter().collect(),
                        last_built_at: file.last_built_at,
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Hash name cache unreadable, starting empty");
                    CacheState::default()
                }
            },
            Err(_) => CacheState::default(),
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> (HashSet<String>, Option<DateTime<Utc>>) {
        let state = self.state.lock();
        (state.keys.clone(), state.last_built_at)
    }

    pub fn len(&self) -> usize {
        self.state.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().keys.is_empty()
    }

    pub fn last_built_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_built_at
    }

    /// Overwrites the set with the keys of a freshly published result set
    /// and persists atomically. The live state is committed even when the
    /// write fails so the running process keeps the correct view.
    pub fn replace(&self, keys: HashSet<String>) -> Result<(), StoreError> {
        let now = Utc::now();
        let file = CacheFile {
            keys: keys.iter().cloned().collect(),
            last_built_at: Some(now),
        };

        {
            let mut state = self.state.lock();
            state.keys = keys;
            state.last_built_at = Some(now);
        }

        self.persist(&file)
    }

    /// Empties the set and removes the backing file. Called whenever a
    /// filter parameter changes: the cached keys no longer reflect the
    /// filters that selected them.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.keys.clear();
            state.last_built_at = None;
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove hash name cache file");
            }
        }
        info!("🧹 Hash name cache cleared");
    }

    fn persist(&self, file: &CacheFile) -> Result<(), StoreError> {
        write_json_atomic(&self.path, file)
    }
}

/// Serializes `value` to `path` via write-to-temp-then-rename so a crash
/// mid-write never leaves a torn file behind.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let persist_err = |source: std::io::Error| StoreError::PersistFailed {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(persist_err)?;
        }
    }

    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::PersistFailed {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).map_err(persist_err)?;
    std::fs::rename(&tmp, path).map_err(persist_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, HashNameCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = HashNameCache::load(dir.path().join("hashname_cache.json"));
        (dir, cache)
    }

    #[test]
    fn replace_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashname_cache.json");

        let cache = HashNameCache::load(&path);
        let keys: HashSet<String> = ["AK-47 | Redline (Field-Tested)", "AWP | Asiimov (Battle-Scarred)"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cache.replace(keys.clone()).unwrap();

        let reloaded = HashNameCache::load(&path);
        let (loaded_keys, built_at) = reloaded.snapshot();
        assert_eq!(loaded_keys, keys);
        assert!(built_at.is_some());
    }

    #[test]
    fn clear_empties_state_and_deletes_file() {
        let (dir, cache) = temp_cache();
        let path = dir.path().join("hashname_cache.json");

        cache
            .replace(["K1".to_string()].into_iter().collect())
            .unwrap();
        assert!(path.exists());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.last_built_at().is_none());
        assert!(!path.exists());

        // Clearing an already-empty cache is a no-op.
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn load_tolerates_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashname_cache.json");
        std::fs::write(&path, b"{not json").unwrap();

        let cache = HashNameCache::load(&path);
        assert!(cache.is_empty());
    }
}

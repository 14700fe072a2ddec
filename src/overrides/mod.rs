//! Client-local date override store.
//!
//! Holds per-intervention date corrections that take precedence over the
//! canonical `dateStart` for every date-windowed computation. Overrides are
//! merged at read time only (the canonical snapshot is never mutated to
//! reflect them) and are cleared by explicit user action, never by the sync
//! engine. Persisted as a plain JSON map so they survive restarts; no schema
//! versioning beyond the key being the intervention identifier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::models::InterventionKey;

/// Local key → override-timestamp mapping.
pub struct OverrideStore {
    path: Option<PathBuf>,
    map: RwLock<HashMap<String, String>>,
}

impl OverrideStore {
    /// In-memory store with no persistence, for tests and embedded use.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Open the store backed by a JSON file, loading any existing content.
    /// A missing or unreadable file starts empty rather than failing.
    pub fn open(path: PathBuf) -> Self {
        let map = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!("Override store at {:?} is unreadable, starting empty: {}", path, err);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: Some(path),
            map: RwLock::new(map),
        }
    }

    /// Override value for an intervention, if any.
    pub fn get(&self, key: &InterventionKey) -> Option<String> {
        self.map
            .read()
            .expect("override store lock poisoned")
            .get(&key.to_string())
            .cloned()
    }

    /// Set or replace the override for an intervention.
    pub fn set(&self, key: &InterventionKey, value: String) {
        {
            let mut map = self.map.write().expect("override store lock poisoned");
            map.insert(key.to_string(), value);
        }
        self.persist();
    }

    /// Clear the override for an intervention. Returns true if one was present.
    pub fn clear(&self, key: &InterventionKey) -> bool {
        let removed = {
            let mut map = self.map.write().expect("override store lock poisoned");
            map.remove(&key.to_string()).is_some()
        };
        if removed {
            self.persist();
        }
        removed
    }

    /// All current overrides, keyed by intervention identifier.
    pub fn all(&self) -> HashMap<String, String> {
        self.map
            .read()
            .expect("override store lock poisoned")
            .clone()
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let map = self.map.read().expect("override store lock poisoned");
        match serde_json::to_string_pretty(&*map) {
            Ok(raw) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(err) = std::fs::write(path, raw) {
                    tracing::warn!("Failed to persist override store to {:?}: {}", path, err);
                }
            }
            Err(err) => tracing::warn!("Failed to serialize override store: {}", err),
        }
    }
}

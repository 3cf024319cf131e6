//! Per-peer audio preference persistence
//!
//! Preferences (mute flag and playback volume) survive across sessions. The
//! store contract is synchronous on purpose: a preference mutation must be
//! durable before the mutating call returns, so a crash immediately after the
//! call never loses it.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Persisted audio preference for one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerAudioPreference {
    /// Whether the peer's audio is locally muted
    #[serde(default)]
    pub muted: bool,

    /// Playback volume, 0.0..=1.0
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_volume() -> f32 {
    1.0
}

impl Default for PeerAudioPreference {
    fn default() -> Self {
        Self {
            muted: false,
            volume: 1.0,
        }
    }
}

impl PeerAudioPreference {
    /// Clamp the volume into the valid range
    pub fn clamped(mut self) -> Self {
        self.volume = self.volume.clamp(0.0, 1.0);
        self
    }
}

/// Storage backend for peer audio preferences
///
/// All methods are synchronous; implementations must make `set` and `remove`
/// durable before returning.
pub trait PreferenceStore: Send + Sync {
    /// Load all persisted preferences
    fn load_all(&self) -> HashMap<String, PeerAudioPreference>;

    /// Get the preference for one peer, if any was persisted
    fn get(&self, peer_id: &str) -> Option<PeerAudioPreference>;

    /// Persist the preference for one peer
    fn set(&self, peer_id: &str, pref: PeerAudioPreference) -> Result<()>;

    /// Remove the persisted preference for one peer
    fn remove(&self, peer_id: &str) -> Result<()>;
}

/// JSON-file-backed preference store
///
/// The whole map is rewritten on every mutation via a temp file and atomic
/// rename. A missing file reads as empty; a corrupt file is logged and read
/// as empty rather than failing channel join.
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, PeerAudioPreference>>,
}

impl JsonFileStore {
    /// Open a store at the given path, loading any existing contents
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt preference file, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read preference file, starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    fn persist(&self, map: &HashMap<String, PeerAudioPreference>) -> Result<()> {
        let json = serde_json::to_string_pretty(map)
            .map_err(|e| Error::SerializationError(format!("Failed to encode preferences: {e}")))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write-then-rename so readers never observe a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for JsonFileStore {
    fn load_all(&self) -> HashMap<String, PeerAudioPreference> {
        self.cache.lock().clone()
    }

    fn get(&self, peer_id: &str) -> Option<PeerAudioPreference> {
        self.cache.lock().get(peer_id).copied()
    }

    fn set(&self, peer_id: &str, pref: PeerAudioPreference) -> Result<()> {
        let mut cache = self.cache.lock();
        cache.insert(peer_id.to_string(), pref.clamped());
        self.persist(&cache)
            .map_err(|e| Error::StoreError(format!("Failed to persist preference: {e}")))
    }

    fn remove(&self, peer_id: &str) -> Result<()> {
        let mut cache = self.cache.lock();
        if cache.remove(peer_id).is_none() {
            return Ok(());
        }
        self.persist(&cache)
            .map_err(|e| Error::StoreError(format!("Failed to persist preference removal: {e}")))
    }
}

/// In-memory preference store, mainly for tests and transient sessions
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, PeerAudioPreference>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryStore {
    fn load_all(&self) -> HashMap<String, PeerAudioPreference> {
        self.map.lock().clone()
    }

    fn get(&self, peer_id: &str) -> Option<PeerAudioPreference> {
        self.map.lock().get(peer_id).copied()
    }

    fn set(&self, peer_id: &str, pref: PeerAudioPreference) -> Result<()> {
        self.map.lock().insert(peer_id.to_string(), pref.clamped());
        Ok(())
    }

    fn remove(&self, peer_id: &str) -> Result<()> {
        self.map.lock().remove(peer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_preference() {
        let pref = PeerAudioPreference::default();
        assert!(!pref.muted);
        assert_eq!(pref.volume, 1.0);
    }

    #[test]
    fn test_volume_clamping() {
        let pref = PeerAudioPreference {
            muted: false,
            volume: 2.5,
        }
        .clamped();
        assert_eq!(pref.volume, 1.0);

        let pref = PeerAudioPreference {
            muted: false,
            volume: -0.5,
        }
        .clamped();
        assert_eq!(pref.volume, 0.0);
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let store = JsonFileStore::open(&path);
        store
            .set(
                "peer-a",
                PeerAudioPreference {
                    muted: true,
                    volume: 0.4,
                },
            )
            .unwrap();

        // Reopen from disk and verify durability
        let reopened = JsonFileStore::open(&path);
        let pref = reopened.get("peer-a").unwrap();
        assert!(pref.muted);
        assert!((pref.volume - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("does-not-exist.json"));
        assert!(store.load_all().is_empty());
        assert!(store.get("peer-a").is_none());
    }

    #[test]
    fn test_corrupt_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "not json at all {{{").unwrap();

        let store = JsonFileStore::open(&path);
        assert!(store.load_all().is_empty());

        // Store remains usable after the corrupt read
        store.set("peer-a", PeerAudioPreference::default()).unwrap();
        assert!(store.get("peer-a").is_some());
    }

    #[test]
    fn test_remove_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let store = JsonFileStore::open(&path);
        store.set("peer-a", PeerAudioPreference::default()).unwrap();
        store.remove("peer-a").unwrap();

        let reopened = JsonFileStore::open(&path);
        assert!(reopened.get("peer-a").is_none());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let store = MemoryStore::new();
        assert!(store.remove("never-set").is_ok());
    }
}

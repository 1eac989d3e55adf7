//! Per-user playback preferences (volume), keyed by user id.
//!
//! The store is an external collaborator; the session only reads volumes
//! when a peer appears and writes them when the user moves a slider.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{VoiceError, VoiceResult};
use crate::peers::{DEFAULT_VOLUME, MAX_VOLUME};

pub trait PreferenceStore: Send + Sync {
    /// Stored volume for a user; `None` if never set.
    fn volume(&self, user_key: &str) -> Option<u8>;

    fn set_volume(&self, user_key: &str, volume: u8) -> VoiceResult<()>;

    /// Stored volume or the default of 100.
    fn volume_or_default(&self, user_key: &str) -> u8 {
        self.volume(user_key).unwrap_or(DEFAULT_VOLUME)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    volumes: Mutex<HashMap<String, u8>>,
}

impl PreferenceStore for MemoryPreferences {
    fn volume(&self, user_key: &str) -> Option<u8> {
        lock(&self.volumes).get(user_key).copied()
    }

    fn set_volume(&self, user_key: &str, volume: u8) -> VoiceResult<()> {
        lock(&self.volumes).insert(user_key.to_owned(), volume.min(MAX_VOLUME));
        Ok(())
    }
}

/// JSON file store, rewritten on every change.
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    volumes: Mutex<HashMap<String, u8>>,
}

impl JsonFilePreferences {
    /// Open `path`; a missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> VoiceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let volumes = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => HashMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                VoiceError::Preferences(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(VoiceError::Preferences(format!("{}: {e}", path.display()))),
        };
        tracing::debug!(path = %path.display(), entries = volumes.len(), "Preferences loaded");
        Ok(Self {
            path,
            volumes: Mutex::new(volumes),
        })
    }

    fn persist(&self, volumes: &HashMap<String, u8>) -> VoiceResult<()> {
        let text = serde_json::to_string_pretty(volumes)
            .map_err(|e| VoiceError::Preferences(e.to_string()))?;
        std::fs::write(&self.path, text)
            .map_err(|e| VoiceError::Preferences(format!("{}: {e}", self.path.display())))
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn volume(&self, user_key: &str) -> Option<u8> {
        lock(&self.volumes).get(user_key).copied()
    }

    fn set_volume(&self, user_key: &str, volume: u8) -> VoiceResult<()> {
        let mut volumes = lock(&self.volumes);
        volumes.insert(user_key.to_owned(), volume.min(MAX_VOLUME));
        self.persist(&volumes)
    }
}

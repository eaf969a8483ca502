//! Key-value persistence for device records.

use crate::error::Result;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Stores one JSON document per device id.
pub trait SettingsStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<String>>;
    fn save(&self, id: &str, json: &str) -> Result<()>;
}

/// Volatile store, mostly useful for tests and hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self, id: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(id).cloned())
    }

    fn save(&self, id: &str, json: &str) -> Result<()> {
        self.entries.lock().insert(id.to_string(), json.to_string());
        Ok(())
    }
}

/// Writes `<dir>/<id>.json`, creating the directory on first save.
///
/// Ids with characters outside `[A-Za-z0-9_-]` are stored as
/// `<hex(id)>.hex.json`, which cannot collide with a plain id.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let plain = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if plain {
            self.dir.join(format!("{}.json", id))
        } else {
            self.dir.join(format!("{}.hex.json", hex::encode(id)))
        }
    }
}

impl SettingsStore for JsonDirStore {
    fn load(&self, id: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(id)) {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, id: &str, json: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(id);
        debug!("Saving device {} to {}", id, path.display());
        fs::write(path, json)?;
        Ok(())
    }
}

//! Persistent key-value storage for resume descriptors.
//!
//! Backends:
//!   - **JSON file**: loaded into memory at open, every mutation written back
//!     atomically via temp+rename. A missing or unreadable file starts empty.
//!   - **Memory**: for tests and ephemeral sessions.
//!
//! [`ResumeStore`] layers typed `DOWNLOAD:<id>` / `UPLOAD:<id>` descriptor
//! access on top of any backend.

use anyhow::Context;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use kegs_core::types::{parse_resume_key, resume_key, ResumeDescriptor, TransferDirection};
use kegs_core::{KegError, KegResult};

pub trait KeyValueStore: Send + Sync {
    fn get_all_keys(&self) -> KegResult<Vec<String>>;
    fn get_value(&self, key: &str) -> KegResult<Option<Value>>;
    fn set_value(&self, key: &str, value: Value) -> KegResult<()>;
    fn remove_value(&self, key: &str) -> KegResult<()>;
}

pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), "resume store unreadable, starting empty: {e}");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), "resume store unreadable, starting empty: {e}");
                BTreeMap::new()
            }
        };

        JsonFileStore {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> KegResult<()> {
        let write = || -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating resume dir: {}", parent.display()))?;
            }
            let json = serde_json::to_string_pretty(entries).context("serializing resume store")?;

            let tmp_path = self.path.with_extension("tmp");
            std::fs::write(&tmp_path, &json)
                .with_context(|| format!("writing resume store temp: {}", tmp_path.display()))?;
            std::fs::rename(&tmp_path, &self.path)
                .with_context(|| format!("renaming resume store: {}", self.path.display()))?;
            Ok(())
        };
        write().map_err(|e| KegError::Storage(format!("{e:#}")))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get_all_keys(&self) -> KegResult<Vec<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    fn get_value(&self, key: &str) -> KegResult<Option<Value>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Value) -> KegResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let mut next = entries.clone();
        next.insert(key.to_string(), value);
        self.flush(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove_value(&self, key: &str) -> KegResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.flush(&next)?;
        *entries = next;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get_all_keys(&self) -> KegResult<Vec<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    fn get_value(&self, key: &str) -> KegResult<Option<Value>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Value) -> KegResult<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn remove_value(&self, key: &str) -> KegResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Typed access to resume descriptors.
#[derive(Clone)]
pub struct ResumeStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ResumeStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    pub fn put(&self, descriptor: &ResumeDescriptor) -> KegResult<()> {
        let value = serde_json::to_value(descriptor)?;
        self.kv.set_value(&descriptor.key(), value)
    }

    pub fn get(&self, direction: TransferDirection, file_id: &str) -> KegResult<Option<ResumeDescriptor>> {
        let key = resume_key(direction, file_id);
        match self.kv.get_value(&key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, direction: TransferDirection, file_id: &str) -> KegResult<()> {
        self.kv.remove_value(&resume_key(direction, file_id))
    }

    /// Every stored descriptor, skipping unrelated keys and corrupt entries.
    pub fn pending(&self) -> KegResult<Vec<ResumeDescriptor>> {
        let mut found = Vec::new();
        for key in self.kv.get_all_keys()? {
            if parse_resume_key(&key).is_none() {
                continue;
            }
            let Some(value) = self.kv.get_value(&key)? else {
                continue;
            };
            match serde_json::from_value::<ResumeDescriptor>(value) {
                Ok(descriptor) => found.push(descriptor),
                Err(e) => warn!(key = %key, "skipping corrupt resume descriptor: {e}"),
            }
        }
        debug!(count = found.len(), "scanned resume descriptors");
        Ok(found)
    }
}

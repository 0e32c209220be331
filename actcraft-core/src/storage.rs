//! # Storage
//!
//! Persistent key-value storage for compiled program artifacts.
//! Backends hold JSON values; [`ProgramStore`] layers a versioned envelope
//! on top so an agent can reload its selected program after a restart.

use crate::error::{self, Result};
use crate::event::current_timestamp;
use crate::program::Program;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Envelope format written by this build
pub const PROGRAM_FORMAT: u32 = 1;

/// Storage backend trait
pub trait StorageBackend: Send + Sync {
    /// `Ok(None)` when the key is absent; unreadable values are errors
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
}

/// In-memory storage (volatile, for tests and dry runs)
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: BTreeMap<String, serde_json::Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}

/// One JSON file per key under a directory
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path).map_err(|e| {
            error::io_error(format!("failed to create storage dir: {}", e))
                .with_context("path", base_path.display().to_string())
        })?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(error::invalid_argument(format!("invalid storage key '{}'", key)));
        }
        Ok(self.base_path.join(format!("{}.json", key)))
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.key_to_path(key)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(error::Error::from(e).with_operation("storage::get")),
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            error::serialization_error(format!("corrupt value for '{}'", key))
                .with_context("path", path.display().to_string())
                .set_source(e)
        })
    }

    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        let path = self.key_to_path(key)?;
        let content = serde_json::to_string_pretty(&value)
            .map_err(|e| error::serialization_error(e.to_string()))?;

        // Write beside the target and rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| error::io_error(format!("failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| error::io_error(format!("failed to replace {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(error::io_error(format!("failed to delete {}: {}", path.display(), e))),
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = std::fs::read_dir(&self.base_path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let path = e.path();
                        if path.extension().is_some_and(|ext| ext == "json") {
                            path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

/// Namespaced, typed access over a backend
pub struct Storage {
    backend: Box<dyn StorageBackend>,
    namespace: Option<String>,
}

impl Storage {
    pub fn memory() -> Self {
        Self::with_backend(MemoryStorage::new())
    }

    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_backend(FileStorage::new(path)?))
    }

    pub fn with_backend(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn full_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, key),
            None => key.to_string(),
        }
    }

    pub fn get_typed<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(&self.full_key(key))? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| {
                    error::serialization_error(format!("value for '{}' has the wrong shape", key))
                        .set_source(e)
                }),
            None => Ok(None),
        }
    }

    pub fn set_typed<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_value(value)
            .map_err(|e| error::serialization_error(e.to_string()))?;
        self.backend.set(&self.full_key(key), json)
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.backend.delete(&self.full_key(key))
    }

    /// Keys inside this namespace, prefix stripped
    pub fn keys(&self) -> Vec<String> {
        let prefix = self.namespace.as_ref().map(|ns| format!("{}.", ns));
        self.backend
            .keys()
            .into_iter()
            .filter_map(|k| match &prefix {
                Some(p) => k.strip_prefix(p.as_str()).map(|s| s.to_string()),
                None => Some(k),
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProgramEnvelope {
    format: u32,
    agent_id: String,
    saved_at: u64,
    program: serde_json::Value,
}

/// Selected program per agent, persisted across restarts
pub struct ProgramStore {
    storage: Storage,
}

impl ProgramStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: storage.with_namespace("program"),
        }
    }

    pub fn memory() -> Self {
        Self::new(Storage::memory())
    }

    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Storage::file(path)?))
    }

    pub fn save(&mut self, agent_id: &str, program: &Program) -> Result<()> {
        let envelope = ProgramEnvelope {
            format: PROGRAM_FORMAT,
            agent_id: agent_id.to_string(),
            saved_at: current_timestamp(),
            program: serde_json::to_value(program)
                .map_err(|e| error::serialization_error(e.to_string()))?,
        };
        self.storage
            .set_typed(agent_id, &envelope)
            .map_err(|e| e.with_operation("program_store::save"))
    }

    /// The persisted program, if any. An envelope of another format is rejected.
    pub fn load(&self, agent_id: &str) -> Result<Option<Program>> {
        let Some(envelope) = self
            .storage
            .get_typed::<ProgramEnvelope>(agent_id)
            .map_err(|e| e.with_operation("program_store::load"))?
        else {
            return Ok(None);
        };

        if envelope.format != PROGRAM_FORMAT {
            return Err(error::version_mismatch(envelope.format, PROGRAM_FORMAT)
                .with_operation("program_store::load")
                .with_context("agent_id", agent_id.to_string()));
        }

        serde_json::from_value(envelope.program).map(Some).map_err(|e| {
            error::serialization_error("stored program is malformed")
                .with_operation("program_store::load")
                .set_source(e)
        })
    }

    pub fn remove(&mut self, agent_id: &str) -> Result<()> {
        self.storage.delete(agent_id)
    }

    /// Agent ids with a persisted program
    pub fn agents(&self) -> Vec<String> {
        self.storage.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_memory_storage() {
        let mut storage = Storage::memory().with_namespace("ns");
        storage.set_typed("k", &vec![1, 2, 3]).unwrap();

        assert_eq!(storage.get_typed::<Vec<u32>>("k").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.keys(), vec!["k".to_string()]);

        storage.delete("k").unwrap();
        assert_eq!(storage.get_typed::<Vec<u32>>("k").unwrap(), None);
    }

    #[test]
    fn test_file_storage_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileStorage::new(dir.path()).unwrap();
        let err = backend.set("../escape", serde_json::json!(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_program_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let program = Program::instruction("tuned", "be terse");

        let mut store = ProgramStore::file(dir.path()).unwrap();
        assert!(store.load("agent-1").unwrap().is_none());
        store.save("agent-1", &program).unwrap();

        let reopened = ProgramStore::file(dir.path()).unwrap();
        assert_eq!(reopened.load("agent-1").unwrap(), Some(program));
        assert_eq!(reopened.agents(), vec!["agent-1".to_string()]);
    }

    #[test]
    fn test_program_store_remove() {
        let mut store = ProgramStore::memory();
        store.save("a", &Program::default()).unwrap();
        store.remove("a").unwrap();
        assert!(store.load("a").unwrap().is_none());
        store.remove("a").unwrap();
    }

    #[test]
    fn test_program_store_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::file(dir.path()).unwrap().with_namespace("program");
        storage
            .set_typed(
                "old",
                &serde_json::json!({"format": 99, "agent_id": "old", "saved_at": 0, "program": {}}),
            )
            .unwrap();

        let err = ProgramStore::file(dir.path()).unwrap().load("old").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("program.bad.json"), "{not json").unwrap();

        let err = ProgramStore::file(dir.path()).unwrap().load("bad").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SerializationFailed);
    }
}

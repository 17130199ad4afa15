//! Durable substrate underneath the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Rows of one collection, ordered by key.
pub type CollectionData = BTreeMap<String, Value>;

/// Full committed state of one container.
///
/// Collections are shared behind `Arc` so a commit only copies the
/// collections it touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub collections: BTreeMap<String, Arc<CollectionData>>,
}

impl Snapshot {
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionData> {
        self.collections.get(name).map(Arc::as_ref)
    }
}

/// Storage for whole-container snapshots.
///
/// Calls are blocking; the engine always drives them from the blocking pool.
/// `persist` must be atomic: after it returns `Err` the previously persisted
/// snapshot is still the one `load` returns.
pub trait Backend: Send + Sync + 'static {
    fn load(&self, name: &str) -> Result<Option<Snapshot>, EngineError>;

    fn persist(&self, name: &str, snapshot: &Snapshot) -> Result<(), EngineError>;

    /// Removing an absent container is not an error.
    fn remove(&self, name: &str) -> Result<(), EngineError>;

    fn kind(&self) -> &'static str {
        "custom"
    }
}

/// Process-local backend. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryBackend {
    containers: Mutex<HashMap<String, Snapshot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn load(&self, name: &str) -> Result<Option<Snapshot>, EngineError> {
        Ok(self.containers.lock().get(name).cloned())
    }

    fn persist(&self, name: &str, snapshot: &Snapshot) -> Result<(), EngineError> {
        self.containers
            .lock()
            .insert(name.to_string(), snapshot.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), EngineError> {
        self.containers.lock().remove(name);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// Container names double as file names, so keep them to a portable set.
pub fn validate_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidName(name.to_string()))
    }
}

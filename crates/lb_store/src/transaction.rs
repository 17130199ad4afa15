//! Transactions over one open container.
//!
//! A [`Transaction`] reads from the snapshot that was committed when it
//! began and stages its own writes on top. Nothing it writes is visible to
//! anyone else until the owning [`Store`](crate::Store) commits it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::engine::{CollectionData, Snapshot};
use crate::error::StoreError;

/// A key and its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row<T> {
    pub key: String,
    pub value: T,
}

impl<T> Row<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Committing,
    Complete,
    Aborting,
    Aborted,
}

impl TxState {
    fn can_move_to(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Pending, Committing)
                | (Committing, Complete)
                | (Pending, Aborting)
                | (Committing, Aborting)
                | (Aborting, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Complete | TxState::Aborted)
    }
}

#[derive(Default)]
struct Staged {
    cleared: bool,
    writes: BTreeMap<String, Option<Value>>,
}

pub struct Transaction {
    id: Uuid,
    mode: TxMode,
    state: TxState,
    scope: BTreeSet<String>,
    base: Arc<Snapshot>,
    staged: BTreeMap<String, Staged>,
}

impl Transaction {
    /// Every collection in `scope` must exist in `base`.
    pub(crate) fn begin(
        mode: TxMode,
        scope: &[&str],
        base: Arc<Snapshot>,
    ) -> Result<Self, StoreError> {
        if let Some(missing) = scope.iter().find(|c| !base.collections.contains_key(**c)) {
            return Err(StoreError::UnknownCollection(missing.to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            mode,
            state: TxState::Pending,
            scope: scope.iter().map(|c| c.to_string()).collect(),
            base,
            staged: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: TxState) {
        if self.state.can_move_to(next) {
            self.state = next;
        } else {
            warn!(tx = %self.id, from = ?self.state, to = ?next, "ignored invalid transaction transition");
        }
    }

    /// Pending → aborting → aborted, dropping every staged write.
    pub(crate) fn abort(&mut self) {
        self.transition(TxState::Aborting);
        self.staged.clear();
        self.transition(TxState::Aborted);
    }

    fn committed(&self, collection: &str) -> Result<&CollectionData, StoreError> {
        if !self.scope.contains(collection) {
            return Err(StoreError::NotInScope(collection.to_string()));
        }
        self.base
            .collection(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }

    fn writable(&mut self, collection: &str) -> Result<&mut Staged, StoreError> {
        self.committed(collection)?;
        if self.mode == TxMode::ReadOnly {
            return Err(StoreError::ReadOnly(collection.to_string()));
        }
        Ok(self.staged.entry(collection.to_string()).or_default())
    }

    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let committed = self.committed(collection)?;
        if let Some(staged) = self.staged.get(collection) {
            if let Some(write) = staged.writes.get(key) {
                return Ok(write.clone());
            }
            if staged.cleared {
                return Ok(None);
            }
        }
        Ok(committed.get(key).cloned())
    }

    pub fn get_row<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Row<T>>, StoreError> {
        match self.get(collection, key)? {
            Some(value) => Ok(Some(Row::new(key, serde_json::from_value(value)?))),
            None => Ok(None),
        }
    }

    pub fn put(&mut self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.writable(collection)?
            .writes
            .insert(key.to_string(), Some(value));
        Ok(())
    }

    pub fn put_row<T: Serialize>(&mut self, collection: &str, row: &Row<T>) -> Result<(), StoreError> {
        let value = serde_json::to_value(&row.value)?;
        self.put(collection, &row.key, value)
    }

    pub fn delete(&mut self, collection: &str, key: &str) -> Result<(), StoreError> {
        self.writable(collection)?
            .writes
            .insert(key.to_string(), None);
        Ok(())
    }

    pub fn clear(&mut self, collection: &str) -> Result<(), StoreError> {
        let staged = self.writable(collection)?;
        staged.cleared = true;
        staged.writes.clear();
        Ok(())
    }

    /// Keys visible to this transaction, in order.
    pub fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.rows(collection)?.into_iter().map(|row| row.key).collect())
    }

    /// Rows visible to this transaction, in key order.
    pub fn rows(&self, collection: &str) -> Result<Vec<Row<Value>>, StoreError> {
        let committed = self.committed(collection)?;
        let Some(staged) = self.staged.get(collection) else {
            return Ok(committed
                .iter()
                .map(|(k, v)| Row::new(k.clone(), v.clone()))
                .collect());
        };
        let mut merged: BTreeMap<&str, &Value> = BTreeMap::new();
        if !staged.cleared {
            merged.extend(committed.iter().map(|(k, v)| (k.as_str(), v)));
        }
        for (key, write) in &staged.writes {
            match write {
                Some(value) => {
                    merged.insert(key.as_str(), value);
                }
                None => {
                    merged.remove(key.as_str());
                }
            }
        }
        Ok(merged
            .into_iter()
            .map(|(k, v)| Row::new(k, v.clone()))
            .collect())
    }

    pub(crate) fn has_writes(&self) -> bool {
        !self.staged.is_empty()
    }

    /// The snapshot this transaction would publish on commit.
    pub(crate) fn staged_snapshot(&self) -> Snapshot {
        let mut next = (*self.base).clone();
        for (name, staged) in &self.staged {
            let Some(collection) = next.collections.get_mut(name) else {
                continue;
            };
            let rows = Arc::make_mut(collection);
            if staged.cleared {
                rows.clear();
            }
            for (key, write) in &staged.writes {
                match write {
                    Some(value) => {
                        rows.insert(key.clone(), value.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        next
    }
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TxCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TxCounters {
    pub(crate) fn begun(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TxStats {
        TxStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

//! Schema evolution.
//!
//! A [`Schema`] is plain data: the target version, the collection set that
//! version requires, and the data migrations registered per version. It is
//! evaluated when a container is opened behind its requested version.

use std::collections::BTreeSet;
use std::sync::Arc;

use lb_core::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::{CollectionData, ContainerCore, Snapshot};
use crate::error::StoreError;

pub type MigrationFn = fn(&mut UpgradeTransaction) -> Result<(), StoreError>;

/// Data migration applied when a container moves up to `version`.
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub transform: MigrationFn,
}

impl Migration {
    pub const fn new(version: u32, transform: MigrationFn) -> Self {
        Self { version, transform }
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u32,
    pub collections: BTreeSet<String>,
    pub migrations: Vec<Migration>,
}

impl Schema {
    pub fn new<I, S>(version: u32, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version,
            collections: collections.into_iter().map(Into::into).collect(),
            migrations: Vec::new(),
        }
    }

    pub fn with_migration(mut self, version: u32, transform: MigrationFn) -> Self {
        self.migrations.push(Migration::new(version, transform));
        self
    }

    /// Migrations that apply when moving from `from` to this schema's
    /// version, in ascending version order.
    pub fn pending(&self, from: u32) -> Vec<Migration> {
        let mut steps: Vec<Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > from && m.version <= self.version)
            .copied()
            .collect();
        steps.sort_by_key(|m| m.version);
        steps
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionDiff {
    pub keep: Vec<String>,
    pub create: Vec<String>,
    pub drop: Vec<String>,
}

impl CollectionDiff {
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.drop.is_empty()
    }
}

/// Classify every name in the union of `existing` and `requested`.
pub fn diff_collections<'a, E, R>(existing: E, requested: R) -> CollectionDiff
where
    E: IntoIterator<Item = &'a str>,
    R: IntoIterator<Item = &'a str>,
{
    let existing: BTreeSet<&str> = existing.into_iter().collect();
    let requested: BTreeSet<&str> = requested.into_iter().collect();
    let mut diff = CollectionDiff::default();
    for name in existing.union(&requested) {
        match (existing.contains(name), requested.contains(name)) {
            (true, true) => diff.keep.push(name.to_string()),
            (true, false) => diff.drop.push(name.to_string()),
            (false, true) => diff.create.push(name.to_string()),
            (false, false) => {}
        }
    }
    diff
}

// ── Upgrade transaction ──────────────────────────────────────────────────────

/// Staged copy of a container handed to each migration. Nothing in it is
/// durable until the whole upgrade commits.
pub struct UpgradeTransaction {
    old_version: u32,
    new_version: u32,
    snapshot: Snapshot,
}

impl UpgradeTransaction {
    fn new(base: &Snapshot, new_version: u32) -> Self {
        Self {
            old_version: base.version,
            new_version,
            snapshot: base.clone(),
        }
    }

    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    /// Returns `false` when the collection already exists.
    pub fn create_collection(&mut self, name: &str) -> bool {
        if self.snapshot.collections.contains_key(name) {
            return false;
        }
        self.snapshot
            .collections
            .insert(name.to_string(), Arc::new(CollectionData::new()));
        true
    }

    /// Returns `false` when the collection did not exist.
    pub fn drop_collection(&mut self, name: &str) -> bool {
        self.snapshot.collections.remove(name).is_some()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.snapshot.collection_names()
    }

    fn collection(&self, name: &str) -> Result<&CollectionData, StoreError> {
        self.snapshot
            .collection(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionData, StoreError> {
        self.snapshot
            .collections
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }

    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.collection(collection)?.get(key).cloned())
    }

    pub fn get_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        self.get(collection, key)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn put(&mut self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.collection_mut(collection)?
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn put_as<T: Serialize>(
        &mut self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.put(collection, key, value)
    }

    pub fn delete(&mut self, collection: &str, key: &str) -> Result<(), StoreError> {
        self.collection_mut(collection)?.remove(key);
        Ok(())
    }

    pub fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.collection(collection)?.keys().cloned().collect())
    }

    fn apply_diff(&mut self, diff: &CollectionDiff) {
        for name in &diff.drop {
            self.drop_collection(name);
        }
        for name in &diff.create {
            self.create_collection(name);
        }
    }
}

/// Bring `core` up to `schema.version` inside a single upgrade transaction.
///
/// Cancellation is checked before the schema diff, before every migration
/// and once more before commit. Any failure leaves the persisted container
/// untouched.
pub(crate) async fn upgrade(
    ctx: &Context,
    core: &ContainerCore,
    schema: &Schema,
) -> Result<(), StoreError> {
    let _writer = core.lock_writer().await;
    let base = core.snapshot();
    let mut tx = UpgradeTransaction::new(&base, schema.version);

    ctx.check()?;
    let diff = diff_collections(
        base.collections.keys().map(String::as_str),
        schema.collections.iter().map(String::as_str),
    );
    info!(
        container = core.name(),
        from = tx.old_version,
        to = tx.new_version,
        create = ?diff.create,
        drop = ?diff.drop,
        "upgrading container"
    );
    tx.apply_diff(&diff);

    for step in schema.pending(tx.old_version) {
        ctx.check()?;
        if let Err(e) = (step.transform)(&mut tx) {
            warn!(container = core.name(), version = step.version, error = %e, "migration failed, upgrade aborted");
            return Err(StoreError::Migration {
                version: step.version,
                source: Box::new(e),
            });
        }
        debug!(container = core.name(), version = step.version, "migration applied");
    }

    ctx.check()?;
    tx.snapshot.version = schema.version;
    let next = Arc::new(tx.snapshot);
    core.persist(next.clone())
        .await
        .map_err(|source| StoreError::Open {
            name: core.name().to_string(),
            source,
        })?;
    core.publish(next);
    Ok(())
}

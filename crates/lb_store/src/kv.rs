//! Typed key/value facade.
//!
//! [`KvStore`] is the per-collection get/set/remove/list/clear surface the
//! application codes against. [`CollectionKv`] implements it over one
//! collection of a [`Store`]; [`InMemoryKv`] is a process-local stand-in.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use lb_core::Context;
use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::{SerdeCodec, ValueCodec};
use crate::db::Store;
use crate::error::StoreError;
use crate::transaction::Row;

#[async_trait]
pub trait KvStore<V: Send + 'static>: Send + Sync {
    /// `Ok(None)` for a missing key unless the implementation is configured
    /// to treat absence as an error.
    async fn get_item(&self, ctx: &Context, key: &str) -> Result<Option<V>, StoreError>;

    async fn set_item(&self, ctx: &Context, key: &str, value: V) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    async fn remove_item(&self, ctx: &Context, key: &str) -> Result<(), StoreError>;

    async fn list_keys(&self, ctx: &Context) -> Result<Vec<String>, StoreError>;

    async fn clear(&self, ctx: &Context) -> Result<(), StoreError>;
}

/// Builds the error returned for a missing key: `(collection, key)`.
pub type NotFoundFn = Arc<dyn Fn(&str, &str) -> StoreError + Send + Sync>;

// ── Collection-backed ────────────────────────────────────────────────────────

pub struct CollectionKv<V, C = SerdeCodec> {
    store: Store,
    collection: String,
    codec: C,
    not_found: Option<NotFoundFn>,
    _value: PhantomData<fn() -> V>,
}

impl<V> CollectionKv<V, SerdeCodec> {
    pub fn new(store: Store, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            codec: SerdeCodec,
            not_found: None,
            _value: PhantomData,
        }
    }
}

impl<V, C> CollectionKv<V, C> {
    pub fn with_codec<C2>(self, codec: C2) -> CollectionKv<V, C2> {
        CollectionKv {
            store: self.store,
            collection: self.collection,
            codec,
            not_found: self.not_found,
            _value: PhantomData,
        }
    }

    /// Missing keys fail with [`StoreError::NotFound`].
    pub fn require_present(self) -> Self {
        self.not_found_with(|collection, key| StoreError::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        })
    }

    /// Missing keys fail with whatever `make` builds, typically a
    /// [`StoreError::custom`] wrapping the caller's own error type.
    pub fn not_found_with<F>(mut self, make: F) -> Self
    where
        F: Fn(&str, &str) -> StoreError + Send + Sync + 'static,
    {
        self.not_found = Some(Arc::new(make));
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

#[async_trait]
impl<V, C> KvStore<V> for CollectionKv<V, C>
where
    V: Send + Sync + 'static,
    C: ValueCodec<V>,
{
    async fn get_item(&self, ctx: &Context, key: &str) -> Result<Option<V>, StoreError> {
        ctx.check()?;
        match self.store.get::<Value>(ctx, &self.collection, key).await? {
            Some(row) => self.codec.decode(row.value).map(Some),
            None => match &self.not_found {
                Some(make) => Err(make(&self.collection, key)),
                None => Ok(None),
            },
        }
    }

    async fn set_item(&self, ctx: &Context, key: &str, value: V) -> Result<(), StoreError> {
        ctx.check()?;
        let encoded = self.codec.encode(&value)?;
        self.store
            .insert_or_update(ctx, &self.collection, &[Row::new(key, encoded)])
            .await
    }

    async fn remove_item(&self, ctx: &Context, key: &str) -> Result<(), StoreError> {
        self.store.delete(ctx, &self.collection, key).await
    }

    async fn list_keys(&self, ctx: &Context) -> Result<Vec<String>, StoreError> {
        self.store.list_keys(ctx, &self.collection).await
    }

    /// One transaction: either every row goes or none does.
    async fn clear(&self, ctx: &Context) -> Result<(), StoreError> {
        self.store.clear(ctx, &self.collection).await
    }
}

// ── Single item ──────────────────────────────────────────────────────────────

/// A collection that holds exactly one record under a fixed key, such as a
/// settings blob.
pub struct SingleItemKv<V, K> {
    inner: K,
    key: String,
    _value: PhantomData<fn() -> V>,
}

impl<V, K> SingleItemKv<V, K>
where
    V: Send + 'static,
    K: KvStore<V>,
{
    pub fn new(inner: K, key: impl Into<String>) -> Self {
        Self {
            inner,
            key: key.into(),
            _value: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn get(&self, ctx: &Context) -> Result<Option<V>, StoreError> {
        self.inner.get_item(ctx, &self.key).await
    }

    pub async fn set(&self, ctx: &Context, value: V) -> Result<(), StoreError> {
        self.inner.set_item(ctx, &self.key, value).await
    }

    pub async fn remove(&self, ctx: &Context) -> Result<(), StoreError> {
        self.inner.remove_item(ctx, &self.key).await
    }
}

// ── In memory ────────────────────────────────────────────────────────────────

pub struct InMemoryKv<V> {
    items: Mutex<BTreeMap<String, V>>,
}

impl<V> InMemoryKv<V> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<V> Default for InMemoryKv<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> KvStore<V> for InMemoryKv<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get_item(&self, ctx: &Context, key: &str) -> Result<Option<V>, StoreError> {
        ctx.check()?;
        Ok(self.items.lock().get(key).cloned())
    }

    async fn set_item(&self, ctx: &Context, key: &str, value: V) -> Result<(), StoreError> {
        ctx.check()?;
        self.items.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, ctx: &Context, key: &str) -> Result<(), StoreError> {
        ctx.check()?;
        self.items.lock().remove(key);
        Ok(())
    }

    async fn list_keys(&self, ctx: &Context) -> Result<Vec<String>, StoreError> {
        ctx.check()?;
        Ok(self.items.lock().keys().cloned().collect())
    }

    async fn clear(&self, ctx: &Context) -> Result<(), StoreError> {
        ctx.check()?;
        self.items.lock().clear();
        Ok(())
    }
}

//! Encryption at rest.
//!
//! Values are serialised to bytes, sealed by the configured [`Crypto`]
//! capability and stored as [`Ciphertext`]. Keys stay in plaintext so lookups
//! and key listings keep working without the secret.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use lb_core::{result, Context};
use lb_crypto::Crypto;
use zeroize::Zeroizing;

use crate::codec::{ByteCodec, Ciphertext, JsonCodec};
use crate::db::Store;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::transaction::Row;

async fn seal<V, C>(crypto: &dyn Crypto, codec: &C, value: &V) -> Result<Ciphertext, StoreError>
where
    C: ByteCodec<V>,
{
    let plain = Zeroizing::new(codec.to_bytes(value)?);
    let sealed = crypto
        .encrypt_data(&plain)
        .await
        .map_err(StoreError::Encrypt)?;
    Ok(Ciphertext(sealed))
}

async fn open<V, C>(crypto: &dyn Crypto, codec: &C, sealed: &Ciphertext) -> Result<V, StoreError>
where
    C: ByteCodec<V>,
{
    let plain = Zeroizing::new(
        crypto
            .decrypt_data(sealed.as_bytes())
            .await
            .map_err(StoreError::Decrypt)?,
    );
    codec.from_bytes(&plain)
}

// ── Over any KV store ────────────────────────────────────────────────────────

/// Encrypting decorator over any [`KvStore`] of [`Ciphertext`].
pub struct EncryptedKv<V, K, C = JsonCodec> {
    inner: K,
    crypto: Arc<dyn Crypto>,
    codec: C,
    _value: PhantomData<fn() -> V>,
}

impl<V, K> EncryptedKv<V, K, JsonCodec> {
    pub fn new(inner: K, crypto: Arc<dyn Crypto>) -> Self {
        Self {
            inner,
            crypto,
            codec: JsonCodec,
            _value: PhantomData,
        }
    }
}

impl<V, K, C> EncryptedKv<V, K, C> {
    pub fn with_codec<C2>(self, codec: C2) -> EncryptedKv<V, K, C2> {
        EncryptedKv {
            inner: self.inner,
            crypto: self.crypto,
            codec,
            _value: PhantomData,
        }
    }

    pub fn inner(&self) -> &K {
        &self.inner
    }
}

#[async_trait]
impl<V, K, C> KvStore<V> for EncryptedKv<V, K, C>
where
    V: Send + Sync + 'static,
    K: KvStore<Ciphertext>,
    C: ByteCodec<V>,
{
    async fn get_item(&self, ctx: &Context, key: &str) -> Result<Option<V>, StoreError> {
        ctx.check()?;
        let Some(sealed) = self.inner.get_item(ctx, key).await? else {
            return Ok(None);
        };
        open(self.crypto.as_ref(), &self.codec, &sealed).await.map(Some)
    }

    async fn set_item(&self, ctx: &Context, key: &str, value: V) -> Result<(), StoreError> {
        ctx.check()?;
        let sealed = seal(self.crypto.as_ref(), &self.codec, &value).await?;
        self.inner.set_item(ctx, key, sealed).await
    }

    async fn remove_item(&self, ctx: &Context, key: &str) -> Result<(), StoreError> {
        self.inner.remove_item(ctx, key).await
    }

    async fn list_keys(&self, ctx: &Context) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys(ctx).await
    }

    async fn clear(&self, ctx: &Context) -> Result<(), StoreError> {
        self.inner.clear(ctx).await
    }
}

// ── Directly over a store collection ─────────────────────────────────────────

/// Encrypted rows in one collection of a [`Store`], keyed by a field of the
/// value itself.
pub struct EncryptedCollection<V, C = JsonCodec> {
    store: Store,
    collection: String,
    crypto: Arc<dyn Crypto>,
    codec: C,
    key_from: fn(&V) -> String,
}

impl<V> EncryptedCollection<V, JsonCodec> {
    pub fn new(
        store: Store,
        collection: impl Into<String>,
        crypto: Arc<dyn Crypto>,
        key_from: fn(&V) -> String,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            crypto,
            codec: JsonCodec,
            key_from,
        }
    }
}

impl<V, C> EncryptedCollection<V, C>
where
    V: Send + Sync + 'static,
    C: ByteCodec<V>,
{
    pub fn with_codec<C2: ByteCodec<V>>(self, codec: C2) -> EncryptedCollection<V, C2> {
        EncryptedCollection {
            store: self.store,
            collection: self.collection,
            crypto: self.crypto,
            codec,
            key_from: self.key_from,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Seal every value first, then write them all in one transaction.
    /// Sealing failures are reported together.
    pub async fn insert_or_update(&self, ctx: &Context, values: &[V]) -> Result<(), StoreError> {
        ctx.check()?;
        let crypto = self.crypto.as_ref();
        let rows = result::all(values.iter().map(|value| async move {
            let sealed = seal(crypto, &self.codec, value).await?;
            Ok::<_, StoreError>(Row::new((self.key_from)(value), sealed))
        }))
        .await?;
        self.store
            .insert_or_update(ctx, &self.collection, &rows)
            .await
    }

    pub async fn get(&self, ctx: &Context, key: &str) -> Result<Option<V>, StoreError> {
        let Some(row) = self
            .store
            .get::<Ciphertext>(ctx, &self.collection, key)
            .await?
        else {
            return Ok(None);
        };
        open(self.crypto.as_ref(), &self.codec, &row.value)
            .await
            .map(Some)
    }

    /// Decrypts every row, then filters. Rows come back in key order; if
    /// any row fails to open, every failure is reported together.
    pub async fn query<P>(&self, ctx: &Context, predicate: P) -> Result<Vec<V>, StoreError>
    where
        P: Fn(&V) -> bool,
    {
        let rows = self
            .store
            .query::<Ciphertext, _>(ctx, &self.collection, |_| true)
            .await?;
        ctx.check()?;
        let crypto = self.crypto.as_ref();
        let values: Vec<V> = result::all(
            rows.iter()
                .map(|row| open(crypto, &self.codec, &row.value)),
        )
        .await?;
        Ok(values.into_iter().filter(|value| predicate(value)).collect())
    }

    pub async fn list_keys(&self, ctx: &Context) -> Result<Vec<String>, StoreError> {
        self.store.list_keys(ctx, &self.collection).await
    }

    pub async fn delete(&self, ctx: &Context, key: &str) -> Result<(), StoreError> {
        self.store.delete(ctx, &self.collection, key).await
    }
}

//! The store handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lb_core::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{ContainerCore, Engine};
use crate::error::StoreError;
use crate::migration::Schema;
use crate::transaction::{Row, Transaction, TxCounters, TxMode, TxState, TxStats};

struct Shared {
    core: Arc<ContainerCore>,
    version: u32,
    closed: AtomicBool,
    stats: TxCounters,
}

impl Shared {
    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.core.release();
        }
        first
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open handle on one container. Cheap to clone; clones share the closed
/// flag, so closing any clone closes them all.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    /// Open (or create) `name` with `collections` at `version`, upgrading the
    /// container first if it is behind.
    pub async fn open<I, S>(
        ctx: &Context,
        engine: &Engine,
        name: &str,
        collections: I,
        version: u32,
    ) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::open_with_schema(ctx, engine, name, Schema::new(version, collections)).await
    }

    pub async fn open_with_schema(
        ctx: &Context,
        engine: &Engine,
        name: &str,
        schema: Schema,
    ) -> Result<Self, StoreError> {
        let core = engine.open_container(ctx, name, &schema).await?;
        info!(container = name, version = schema.version, "store opened");
        Ok(Self {
            shared: Arc::new(Shared {
                core,
                version: schema.version,
                closed: AtomicBool::new(false),
                stats: TxCounters::default(),
            }),
        })
    }

    /// Every later operation on this handle (and its clones) fails with
    /// [`StoreError::Closed`]. Closing twice is harmless.
    pub fn close(&self) {
        if self.shared.close() {
            info!(container = self.name(), "store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        self.shared.core.name()
    }

    pub fn version(&self) -> u32 {
        self.shared.version
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.shared.core.snapshot().collection_names()
    }

    pub fn stats(&self) -> TxStats {
        self.shared.stats.snapshot()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run `body` in one transaction over the collections in `scope`.
    ///
    /// `body` is synchronous: it works against the transaction handle only
    /// and cannot await anything else while the transaction is live. If it
    /// returns `Err` the transaction is aborted and that error is returned
    /// unchanged. Otherwise the staged writes are committed and the call
    /// resolves only once they are durable.
    pub async fn transaction<R, F>(
        &self,
        ctx: &Context,
        scope: &[&str],
        mode: TxMode,
        body: F,
    ) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Transaction) -> Result<R, StoreError> + Send,
        R: Send,
    {
        ctx.check()?;
        self.ensure_open()?;

        let core = &self.shared.core;
        let _writer = match mode {
            TxMode::ReadWrite => tokio::select! {
                biased;
                reason = ctx.cancelled() => return Err(reason.into()),
                guard = core.lock_writer() => Some(guard),
            },
            TxMode::ReadOnly => None,
        };
        ctx.check()?;
        self.ensure_open()?;

        let mut tx = Transaction::begin(mode, scope, core.snapshot())?;
        self.shared.stats.begun();

        let value = match body(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                tx.abort();
                self.shared.stats.aborted();
                debug!(container = self.name(), tx = %tx.id(), error = %e, "transaction body failed");
                return Err(e);
            }
        };
        if let Err(reason) = ctx.check() {
            tx.abort();
            self.shared.stats.aborted();
            return Err(reason.into());
        }

        tx.transition(TxState::Committing);
        self.commit(&mut tx).await?;
        Ok(value)
    }

    async fn commit(&self, tx: &mut Transaction) -> Result<(), StoreError> {
        if !tx.has_writes() {
            tx.transition(TxState::Complete);
            self.shared.stats.committed();
            return Ok(());
        }
        if self.is_closed() {
            tx.abort();
            self.shared.stats.aborted();
            return Err(StoreError::aborted("store handle closed before commit"));
        }

        let core = &self.shared.core;
        let next = Arc::new(tx.staged_snapshot());
        match core.persist(next.clone()).await {
            Ok(()) => {
                core.publish(next);
                tx.transition(TxState::Complete);
                self.shared.stats.committed();
                debug!(container = self.name(), tx = %tx.id(), "transaction committed");
                Ok(())
            }
            Err(source) => {
                tx.abort();
                self.shared.stats.aborted();
                warn!(container = self.name(), tx = %tx.id(), error = %source, "commit rejected by engine");
                Err(StoreError::TransactionAborted {
                    reason: "engine rejected the commit".into(),
                    source: Some(source),
                })
            }
        }
    }

    /// Upsert every row in one transaction. If the context is cancelled or
    /// any row fails to serialise, none of them are written.
    pub async fn insert_or_update<T>(
        &self,
        ctx: &Context,
        collection: &str,
        rows: &[Row<T>],
    ) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        self.transaction(ctx, &[collection], TxMode::ReadWrite, |tx| {
            for row in rows {
                ctx.check()?;
                tx.put_row(collection, row)?;
            }
            Ok(())
        })
        .await
    }

    /// `None` when the key does not exist.
    pub async fn get<T>(
        &self,
        ctx: &Context,
        collection: &str,
        key: &str,
    ) -> Result<Option<Row<T>>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        self.transaction(ctx, &[collection], TxMode::ReadOnly, |tx| {
            tx.get_row(collection, key)
        })
        .await
    }

    pub async fn list_keys(&self, ctx: &Context, collection: &str) -> Result<Vec<String>, StoreError> {
        self.transaction(ctx, &[collection], TxMode::ReadOnly, |tx| tx.keys(collection))
            .await
    }

    /// Full scan of `collection`, keeping the rows `predicate` accepts.
    pub async fn query<T, P>(
        &self,
        ctx: &Context,
        collection: &str,
        predicate: P,
    ) -> Result<Vec<Row<T>>, StoreError>
    where
        T: DeserializeOwned + Send,
        P: Fn(&Row<T>) -> bool + Send,
    {
        self.transaction(ctx, &[collection], TxMode::ReadOnly, move |tx| {
            let mut matched = Vec::new();
            for raw in tx.rows(collection)? {
                let row = Row::new(raw.key, serde_json::from_value::<T>(raw.value)?);
                if predicate(&row) {
                    matched.push(row);
                }
            }
            Ok(matched)
        })
        .await
    }

    /// Deleting an absent key is not an error.
    pub async fn delete(&self, ctx: &Context, collection: &str, key: &str) -> Result<(), StoreError> {
        self.transaction(ctx, &[collection], TxMode::ReadWrite, |tx| {
            tx.delete(collection, key)
        })
        .await
    }

    /// Remove every row of `collection` in a single transaction.
    pub async fn clear(&self, ctx: &Context, collection: &str) -> Result<(), StoreError> {
        self.transaction(ctx, &[collection], TxMode::ReadWrite, |tx| tx.clear(collection))
            .await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

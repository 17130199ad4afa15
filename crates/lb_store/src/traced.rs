//! Tracing decorator for [`KvStore`] implementations.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Instant;

use async_trait::async_trait;
use lb_core::Context;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::kv::KvStore;

/// Context data key under which callers put a `String` trace id.
pub const TRACE_ID_KEY: &str = "lockbox.trace_id";

/// Wraps a [`KvStore`] and records every call in a `kv` span carrying the
/// operation, store name, key, a fresh `op_id` and the caller's trace id.
pub struct TracedKv<V, K> {
    inner: K,
    store: String,
    _value: PhantomData<fn() -> V>,
}

impl<V, K> TracedKv<V, K>
where
    V: Send + 'static,
    K: KvStore<V>,
{
    pub fn new(store: impl Into<String>, inner: K) -> Self {
        Self {
            inner,
            store: store.into(),
            _value: PhantomData,
        }
    }

    pub fn inner(&self) -> &K {
        &self.inner
    }

    pub fn into_inner(self) -> K {
        self.inner
    }

    async fn traced<T, F>(
        &self,
        ctx: &Context,
        op: &'static str,
        key: Option<&str>,
        call: F,
    ) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let trace_id = ctx
            .get_data::<String>(TRACE_ID_KEY)
            .map(String::as_str)
            .unwrap_or("-");
        let span = info_span!(
            "kv",
            op,
            store = %self.store,
            key = key.unwrap_or(""),
            op_id = %Uuid::new_v4(),
            trace_id
        );
        let started = Instant::now();
        let result = call.instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        span.in_scope(|| match &result {
            Ok(_) => debug!(elapsed_ms, "kv call finished"),
            Err(e) => warn!(elapsed_ms, error = %e, "kv call failed"),
        });
        result
    }
}

#[async_trait]
impl<V, K> KvStore<V> for TracedKv<V, K>
where
    V: Send + 'static,
    K: KvStore<V>,
{
    async fn get_item(&self, ctx: &Context, key: &str) -> Result<Option<V>, StoreError> {
        self.traced(ctx, "get_item", Some(key), self.inner.get_item(ctx, key))
            .await
    }

    async fn set_item(&self, ctx: &Context, key: &str, value: V) -> Result<(), StoreError> {
        self.traced(ctx, "set_item", Some(key), self.inner.set_item(ctx, key, value))
            .await
    }

    async fn remove_item(&self, ctx: &Context, key: &str) -> Result<(), StoreError> {
        self.traced(ctx, "remove_item", Some(key), self.inner.remove_item(ctx, key))
            .await
    }

    async fn list_keys(&self, ctx: &Context) -> Result<Vec<String>, StoreError> {
        self.traced(ctx, "list_keys", None, self.inner.list_keys(ctx))
            .await
    }

    async fn clear(&self, ctx: &Context) -> Result<(), StoreError> {
        self.traced(ctx, "clear", None, self.inner.clear(ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[tokio::test]
    async fn forwards_results_unchanged() {
        lb_core::logging::init("debug");
        let kv = TracedKv::<u32, _>::new("prefs", InMemoryKv::new());
        let ctx = Context::background().with_data(TRACE_ID_KEY, "req-7".to_string());

        kv.set_item(&ctx, "volume", 11).await.unwrap();
        assert_eq!(kv.get_item(&ctx, "volume").await.unwrap(), Some(11));
        assert_eq!(kv.list_keys(&ctx).await.unwrap(), vec!["volume"]);
        kv.remove_item(&ctx, "volume").await.unwrap();
        kv.clear(&ctx).await.unwrap();
        assert!(kv.inner().is_empty());
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let kv = TracedKv::<u32, _>::new("prefs", InMemoryKv::new());
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = kv.get_item(&ctx, "volume").await.unwrap_err();
        assert!(err.is_cancelled());
    }
}

//! Versioned container engine.
//!
//! An [`Engine`] owns one [`Backend`] and the registry of live containers.
//! Every handle opened on the same container name through the same engine
//! shares one in-memory core: the committed snapshot and the writer lock.

pub mod backend;
pub(crate) mod completion;
pub mod file;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use lb_core::Context;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

pub use backend::{validate_name, Backend, CollectionData, MemoryBackend, Snapshot};
pub use file::FileBackend;

use crate::config::{BackendKind, StoreConfig};
use crate::error::{EngineError, StoreError};
use crate::migration::{self, Schema};
use completion::{run_blocking, Completion};

// ── Container core ───────────────────────────────────────────────────────────

pub(crate) struct ContainerCore {
    name: String,
    backend: Arc<dyn Backend>,
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    open_handles: AtomicUsize,
}

impl ContainerCore {
    fn new(name: &str, backend: Arc<dyn Backend>, snapshot: Snapshot) -> Self {
        Self {
            name: name.to_string(),
            backend,
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            open_handles: AtomicUsize::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The last committed snapshot.
    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Swap in a snapshot that has already been persisted. Callers hold the
    /// writer lock.
    pub(crate) fn publish(&self, next: Arc<Snapshot>) {
        *self.snapshot.write() = next;
    }

    /// Serialises read-write transactions and upgrades on this container.
    pub(crate) async fn lock_writer(&self) -> OwnedMutexGuard<()> {
        self.writer.clone().lock_owned().await
    }

    pub(crate) fn persist(&self, snapshot: Arc<Snapshot>) -> Completion<()> {
        let backend = self.backend.clone();
        let name = self.name.clone();
        run_blocking(move || backend.persist(&name, &snapshot))
    }

    pub(crate) fn retain(&self) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        self.open_handles.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

struct EngineInner {
    backend: Arc<dyn Backend>,
    live: Mutex<HashMap<String, Weak<ContainerCore>>>,
    opening: tokio::sync::Mutex<()>,
}

/// Cheap to clone; clones share the backend and the live-container registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend,
                live: Mutex::new(HashMap::new()),
                opening: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        Ok(Self::with_backend(Arc::new(FileBackend::new(root)?)))
    }

    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        let engine = match config.backend {
            BackendKind::Memory => Self::in_memory(),
            BackendKind::File => {
                let root = config.resolved_data_dir()?;
                let backend = FileBackend::new(&root)?
                    .with_fsync(config.fsync)
                    .with_quota(config.max_container_bytes);
                info!(root = %root.display(), fsync = config.fsync, "file engine ready");
                Self::with_backend(Arc::new(backend))
            }
        };
        Ok(engine)
    }

    pub fn backend_kind(&self) -> &'static str {
        self.inner.backend.kind()
    }

    fn live_core(&self, name: &str) -> Option<Arc<ContainerCore>> {
        let mut live = self.inner.live.lock();
        match live.get(name).and_then(Weak::upgrade) {
            Some(core) => Some(core),
            None => {
                live.remove(name);
                None
            }
        }
    }

    /// Open `name` at `schema.version`, upgrading it first when the stored
    /// version is behind. The returned core already counts the new handle.
    pub(crate) async fn open_container(
        &self,
        ctx: &Context,
        name: &str,
        schema: &Schema,
    ) -> Result<Arc<ContainerCore>, StoreError> {
        ctx.check()?;
        if schema.version == 0 {
            return Err(StoreError::InvalidVersion(0));
        }
        validate_name(name).map_err(|source| StoreError::Open {
            name: name.to_string(),
            source,
        })?;

        let _opening = self.inner.opening.lock().await;
        ctx.check()?;

        let core = match self.live_core(name) {
            Some(core) => core,
            None => {
                let backend = self.inner.backend.clone();
                let key = name.to_string();
                let loaded = run_blocking(move || backend.load(&key))
                    .await
                    .map_err(|source| StoreError::Open {
                        name: name.to_string(),
                        source,
                    })?;
                let core = Arc::new(ContainerCore::new(
                    name,
                    self.inner.backend.clone(),
                    loaded.unwrap_or_default(),
                ));
                self.inner
                    .live
                    .lock()
                    .insert(name.to_string(), Arc::downgrade(&core));
                core
            }
        };

        let stored = core.snapshot().version;
        if stored > schema.version {
            return Err(StoreError::VersionConflict {
                name: name.to_string(),
                stored,
                requested: schema.version,
            });
        }
        if stored < schema.version {
            if core.open_handles() > 0 {
                return Err(StoreError::Blocked(name.to_string()));
            }
            migration::upgrade(ctx, &core, schema).await?;
        } else {
            debug!(container = name, version = stored, "container already current");
        }

        ctx.check()?;
        core.retain();
        Ok(core)
    }

    /// Delete a container and everything in it.
    pub async fn delete_container(&self, ctx: &Context, name: &str) -> Result<(), StoreError> {
        ctx.check()?;
        validate_name(name)?;
        let _opening = self.inner.opening.lock().await;
        ctx.check()?;

        if let Some(core) = self.live_core(name) {
            if core.open_handles() > 0 {
                return Err(StoreError::Blocked(name.to_string()));
            }
        }
        self.inner.live.lock().remove(name);

        let backend = self.inner.backend.clone();
        let key = name.to_string();
        run_blocking(move || backend.remove(&key)).await?;
        info!(container = name, "container deleted");
        Ok(())
    }

    /// The committed version of `name`, or `None` when it does not exist.
    pub async fn stored_version(&self, ctx: &Context, name: &str) -> Result<Option<u32>, StoreError> {
        ctx.check()?;
        validate_name(name)?;
        if let Some(core) = self.live_core(name) {
            let version = core.snapshot().version;
            return Ok((version > 0).then_some(version));
        }
        let backend = self.inner.backend.clone();
        let key = name.to_string();
        let loaded = run_blocking(move || backend.load(&key)).await?;
        Ok(loaded.map(|s| s.version))
    }
}

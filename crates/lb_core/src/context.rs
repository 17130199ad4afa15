//! Hierarchical cancellation context.
//!
//! A [`Context`] is threaded explicitly through every storage call. It carries
//! an optional cancellation signal, an optional deadline and a small bag of
//! named values (trace ids and similar diagnostic handles).
//!
//! Cancellation is push-based: each cancellable node registers itself with the
//! signal of every ancestor it derives from when it is built, and firing a
//! signal walks down to all live descendants. Cancelling a child never touches
//! its parent.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Cancelled;

// ── Signal ───────────────────────────────────────────────────────────────────

struct Signal {
    fired: AtomicBool,
    reason: Mutex<Option<Cancelled>>,
    children: Mutex<Vec<Weak<Signal>>>,
    notify: Notify,
}

impl Signal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            reason: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn reason(&self) -> Option<Cancelled> {
        self.reason.lock().clone()
    }

    /// Subscribe `child` to this signal. If this signal already fired the
    /// child fires immediately with the same reason.
    fn attach(&self, child: &Arc<Signal>) {
        let mut children = self.children.lock();
        if self.is_fired() {
            drop(children);
            child.fire(self.reason().unwrap_or(Cancelled::Unknown));
            return;
        }
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(child));
    }

    /// First reason wins; later calls are no-ops.
    fn fire(&self, reason: Cancelled) {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        let children = {
            let mut children = self.children.lock();
            self.fired.store(true, Ordering::Release);
            std::mem::take(&mut *children)
        };
        self.notify.notify_waiters();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.fire(reason.clone());
        }
    }
}

#[derive(Clone)]
struct Deadline {
    at: Instant,
    owner: Arc<Signal>,
}

type DataBag = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

// ── Cancel handles ───────────────────────────────────────────────────────────

/// Cancels the context returned alongside it by [`Context::with_cancel`] or
/// [`Context::with_timeout`], and all of that context's descendants.
#[derive(Clone)]
pub struct CancelFunc {
    signal: Arc<Signal>,
}

impl CancelFunc {
    pub fn cancel(&self) {
        self.signal.fire(Cancelled::Cancelled);
    }

    pub fn cancel_with(&self, reason: impl Into<String>) {
        self.signal.fire(Cancelled::Reason(reason.into()));
    }
}

impl fmt::Debug for CancelFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelFunc")
            .field("fired", &self.signal.is_fired())
            .finish()
    }
}

/// An external cancellation source that is not itself a context. Any number
/// of contexts may subscribe to it through [`Context::with_signal`].
#[derive(Clone)]
pub struct CancelSource {
    signal: Arc<Signal>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    pub fn cancel(&self) {
        self.signal.fire(Cancelled::Cancelled);
    }

    pub fn cancel_with(&self, reason: impl Into<String>) {
        self.signal.fire(Cancelled::Reason(reason.into()));
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_fired()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

/// Immutable node in the context tree. Cheap to clone.
#[derive(Clone, Default)]
pub struct Context {
    signal: Option<Arc<Signal>>,
    deadline: Option<Deadline>,
    data: Arc<DataBag>,
}

impl Context {
    /// The root context: never cancelled, no deadline, empty data bag.
    pub fn background() -> Self {
        Self::default()
    }

    fn derive(&self, extra_parent: Option<&Arc<Signal>>) -> (Context, Arc<Signal>) {
        let signal = Signal::new();
        if let Some(parent) = &self.signal {
            parent.attach(&signal);
        }
        if let Some(extra) = extra_parent {
            extra.attach(&signal);
        }
        let ctx = Context {
            signal: Some(signal.clone()),
            deadline: self.deadline.clone(),
            data: self.data.clone(),
        };
        (ctx, signal)
    }

    pub fn with_cancel(&self) -> (Context, CancelFunc) {
        let (ctx, signal) = self.derive(None);
        (ctx, CancelFunc { signal })
    }

    /// Like [`with_cancel`](Self::with_cancel), and additionally cancelled
    /// with [`Cancelled::DeadlineExceeded`] once `timeout` has elapsed.
    /// A timeout too large to represent (e.g. `Duration::MAX`) adds no
    /// deadline of its own.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelFunc) {
        let (mut ctx, signal) = self.derive(None);
        let Some(at) = Instant::now().checked_add(timeout) else {
            return (ctx, CancelFunc { signal });
        };

        let inherited_is_sooner = matches!(&self.deadline, Some(d) if d.at <= at);
        if !inherited_is_sooner {
            ctx.deadline = Some(Deadline {
                at,
                owner: signal.clone(),
            });
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let timer = signal.clone();
                handle.spawn(async move {
                    let notified = timer.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if timer.is_fired() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            debug!("context deadline exceeded");
                            timer.fire(Cancelled::DeadlineExceeded);
                        }
                        _ = notified => {}
                    }
                });
            }
        }

        (ctx, CancelFunc { signal })
    }

    /// Child context that is cancelled when either this context or `source`
    /// is cancelled.
    pub fn with_signal(&self, source: &CancelSource) -> Context {
        self.derive(Some(&source.signal)).0
    }

    /// Child context carrying one more named value. Cancellation state is
    /// shared with `self`.
    pub fn with_data<V>(&self, key: &'static str, value: V) -> Context
    where
        V: Any + Send + Sync,
    {
        let mut data = (*self.data).clone();
        data.insert(key, Arc::new(value));
        Context {
            signal: self.signal.clone(),
            deadline: self.deadline.clone(),
            data: Arc::new(data),
        }
    }

    /// The value stored under `key`, if present and of type `V`.
    pub fn get_data<V: Any>(&self, key: &str) -> Option<&V> {
        self.data.get(key).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn get_data_or<'a, V: Any>(&'a self, key: &str, fallback: &'a V) -> &'a V {
        self.get_data(key).unwrap_or(fallback)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.as_ref().map(|d| d.at)
    }

    pub fn is_cancelled(&self) -> bool {
        if self.signal.as_ref().is_some_and(|s| s.is_fired()) {
            return true;
        }
        match &self.deadline {
            Some(d) if Instant::now() >= d.at => {
                d.owner.fire(Cancelled::DeadlineExceeded);
                true
            }
            _ => false,
        }
    }

    /// The recorded cancellation reason, or `None` while still live.
    pub fn err(&self) -> Option<Cancelled> {
        if !self.is_cancelled() {
            return None;
        }
        Some(
            self.signal
                .as_ref()
                .and_then(|s| s.reason())
                .unwrap_or(Cancelled::Unknown),
        )
    }

    /// Cancellation checkpoint: `Err` once the context is cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        match self.err() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Resolves with the cancellation reason once this context is cancelled.
    /// Never resolves for a context without a signal.
    pub async fn cancelled(&self) -> Cancelled {
        let Some(signal) = &self.signal else {
            return std::future::pending().await;
        };
        loop {
            let notified = signal.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.err() {
                return reason;
            }
            match self.deadline() {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&&str> = self.data.keys().collect();
        keys.sort();
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .field("data", &keys)
            .finish()
    }
}

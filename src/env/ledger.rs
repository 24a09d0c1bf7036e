//! Resource tracking for scoped release.
//!
//! A [`Ledger`] maps acquired resources (identified by the address of their
//! shared allocation) to the effect that releases them. Ledgers nest: a
//! release request that misses the current scope is forwarded to the parent.
//!
//! Entries are removed *before* their release effect runs, so a resource is
//! released at most once even if two scopes race to release it. Each entry
//! holds a clone of the resource's `Arc`, so its address cannot be reused by
//! another allocation while it is registered.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::effect::Effect;

static NEXT_LEDGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an acquired resource: the address of its `Arc` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(usize);

impl ResourceKey {
    /// The key of a shared resource. Clones of the same `Arc` share a key.
    #[inline]
    #[must_use]
    pub fn of<R: ?Sized>(resource: &Arc<R>) -> Self {
        Self(Arc::as_ptr(resource).cast::<()>().addr())
    }
}

struct Entry {
    sequence: u64,
    release: Effect<()>,
    _resource: Box<dyn Any + Send + Sync>,
}

struct LedgerInner {
    id: u64,
    entries: Mutex<FxHashMap<ResourceKey, Entry>>,
    next_sequence: AtomicU64,
    parent: Option<Ledger>,
}

/// A thread-safe, nestable map from resources to their release effects.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

impl Ledger {
    /// Creates a root ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Self>) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                id: NEXT_LEDGER_ID.fetch_add(1, Ordering::Relaxed),
                entries: Mutex::new(FxHashMap::default()),
                next_sequence: AtomicU64::new(0),
                parent,
            }),
        }
    }

    /// Creates a nested ledger whose misses fall back to `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// The enclosing ledger, if any.
    pub fn parent(&self) -> Option<&Self> {
        self.inner.parent.as_ref()
    }

    /// Numeric identifier used in log records.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Registers `release` for `resource` in this scope.
    ///
    /// The ledger keeps `resource` alive until its entry is released.
    /// Returns `false` and keeps the existing entry if `resource` is already
    /// registered here.
    pub fn acquire<R>(&self, resource: &Arc<R>, release: Effect<()>) -> bool
    where
        R: ?Sized + Send + Sync + 'static,
    {
        let key = ResourceKey::of(resource);
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.inner.entries.lock();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(
            key,
            Entry {
                sequence,
                release,
                _resource: Box::new(Arc::clone(resource)),
            },
        );
        drop(entries);
        tracing::trace!(ledger = self.inner.id, ?key, "resource acquired");
        true
    }

    /// Returns whether `key` is registered in this scope (parents excluded).
    pub fn contains(&self, key: ResourceKey) -> bool {
        self.inner.entries.lock().contains_key(&key)
    }

    /// Number of resources registered in this scope.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns `true` if this scope holds no resources.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Removes the entry for `key` from the nearest scope holding it.
    fn take(&self, key: ResourceKey) -> Option<Effect<()>> {
        let mut scope = Some(self);
        while let Some(ledger) = scope {
            if let Some(entry) = ledger.inner.entries.lock().remove(&key) {
                tracing::trace!(ledger = ledger.inner.id, ?key, "resource released");
                return Some(entry.release);
            }
            scope = ledger.parent();
        }
        None
    }

    /// Releases the resource registered under `key`.
    ///
    /// The lookup happens when the returned effect runs. Unknown keys are a
    /// no-op; failures of the release effect propagate.
    pub fn release(&self, key: ResourceKey) -> Effect<()> {
        let ledger = self.clone();
        Effect::defer(move || ledger.take(key).unwrap_or_else(Effect::unit))
    }

    /// Releases every resource of this scope, most recent first.
    ///
    /// Release failures are logged and swallowed so every resource gets its
    /// chance to run.
    pub fn release_all(&self) -> Effect<()> {
        let ledger = self.clone();
        Effect::defer(move || {
            let mut drained: Vec<(ResourceKey, Entry)> =
                ledger.inner.entries.lock().drain().collect();
            drained.sort_unstable_by(|(_, left), (_, right)| right.sequence.cmp(&left.sequence));

            if !drained.is_empty() {
                tracing::debug!(
                    ledger = ledger.inner.id,
                    count = drained.len(),
                    "releasing scope resources"
                );
            }

            let id = ledger.inner.id;
            drained
                .into_iter()
                .fold(Effect::unit(), |released, (key, entry)| {
                    released.then(entry.release.catch_all(move |error| {
                        tracing::warn!(ledger = id, ?key, %error, "resource release failed");
                        Effect::unit()
                    }))
                })
        })
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Ledger")
            .field("id", &self.inner.id)
            .field("resources", &self.len())
            .field("parent", &self.parent().map(Self::id))
            .finish()
    }
}

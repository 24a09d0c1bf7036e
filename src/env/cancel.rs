//! Cooperative cancellation.
//!
//! A [`CancelSource`] is the trigger; the [`CancelToken`]s it hands out can
//! only observe. Sources can be *linked* to a parent token: cancelling the
//! parent cancels every linked child, never the reverse.
//!
//! Cancellation is a flag checked at step boundaries, not an unwinding
//! mechanism. Asynchronous code can wait for it with
//! [`CancelToken::cancelled`].
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::env::CancelSource;
//!
//! let parent = CancelSource::new();
//! let child = CancelSource::linked(&parent.token());
//!
//! assert!(!child.token().is_cancelled());
//! parent.cancel();
//! assert!(child.token().is_cancelled());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct CancelState {
    id: u64,
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
    parent: Mutex<Option<Weak<CancelState>>>,
}

impl CancelState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels this state and every linked descendant.
    ///
    /// Walks the tree with an explicit stack so deep link chains cannot
    /// overflow the call stack.
    fn cancel(self: &Arc<Self>) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::trace!(token = self.id, "cancellation triggered");
        self.notify.notify_waiters();

        let mut pending = std::mem::take(&mut *self.children.lock());
        while let Some(child) = pending.pop() {
            let Some(child) = child.upgrade() else {
                continue;
            };
            if child.cancelled.swap(true, Ordering::AcqRel) {
                continue;
            }
            tracing::trace!(token = child.id, parent = self.id, "cancellation propagated");
            child.notify.notify_waiters();
            pending.append(&mut child.children.lock());
        }
        true
    }
}

/// A read-only view of a cancellation signal.
///
/// Tokens are cheap to clone. [`CancelToken::never`] is a token that is never
/// cancelled, used for uninterruptible sections.
#[derive(Clone)]
pub struct CancelToken {
    state: Option<Arc<CancelState>>,
}

impl CancelToken {
    /// A token that is never cancelled.
    #[must_use]
    pub const fn never() -> Self {
        Self { state: None }
    }

    /// Returns whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.is_cancelled())
    }

    /// Fails with [`Error::Cancelled`] if cancellation has been requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] once the token is cancelled.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes once the token is cancelled. Never completes for
    /// [`CancelToken::never`].
    pub async fn cancelled(&self) {
        let Some(state) = &self.state else {
            return std::future::pending().await;
        };
        loop {
            let notified = state.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a concurrent
            // `notify_waiters` cannot slip between the check and the await.
            notified.as_mut().enable();
            if state.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns whether two tokens observe the same signal.
    pub fn same_as(&self, other: &Self) -> bool {
        match (&self.state, &other.state) {
            (Some(left), Some(right)) => Arc::ptr_eq(left, right),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => formatter
                .debug_struct("CancelToken")
                .field("id", &state.id)
                .field("cancelled", &state.is_cancelled())
                .finish(),
            None => formatter.write_str("CancelToken(never)"),
        }
    }
}

/// The trigger side of a cancellation signal.
///
/// Clones share the same signal. A linked source stays registered with its
/// parent until [`dispose`](Self::dispose) is called or it is dropped
/// everywhere.
#[derive(Clone)]
pub struct CancelSource {
    state: Arc<CancelState>,
}

impl CancelSource {
    /// Creates an independent source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CancelState::new(),
        }
    }

    /// Creates a source that is also cancelled when `parent` is cancelled.
    ///
    /// If `parent` is already cancelled the new source starts cancelled.
    #[must_use]
    pub fn linked(parent: &CancelToken) -> Self {
        let source = Self::new();
        let Some(parent_state) = &parent.state else {
            return source;
        };

        let already_cancelled = {
            let mut children = parent_state.children.lock();
            if parent_state.is_cancelled() {
                true
            } else {
                children.retain(|child| child.strong_count() > 0);
                children.push(Arc::downgrade(&source.state));
                false
            }
        };

        if already_cancelled {
            source.state.cancel();
        } else {
            *source.state.parent.lock() = Some(Arc::downgrade(parent_state));
        }
        source
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Requests cancellation. Returns `true` if this call performed the
    /// transition, `false` if the source was already cancelled.
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Unlinks this source from its parent. Idempotent.
    ///
    /// After disposal, cancelling the parent no longer reaches this source.
    pub fn dispose(&self) {
        let parent = self.state.parent.lock().take();
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent.children.lock().retain(|child| {
                child.strong_count() > 0 && !std::ptr::eq(child.as_ptr(), Arc::as_ptr(&self.state))
            });
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CancelSource")
            .field("id", &self.state.id)
            .field("cancelled", &self.state.is_cancelled())
            .finish()
    }
}

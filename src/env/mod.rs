//! The execution environment threaded through every effect step.
//!
//! An [`Env`] bundles:
//!
//! - a cancellation token (checked before every interpreter step),
//! - an optional cancellation trigger owned by this scope,
//! - a resource [`Ledger`],
//! - an optional thread-affinity token: the tokio runtime [`Handle`] forks
//!   and timers are spawned on.
//!
//! Environments are immutable per scope. Derived environments are created for
//! nested resource scopes, localized cancellation, uninterruptible sections and
//! timeouts. A derived environment that owns a trigger must be
//! [disposed](Env::dispose) when its scope exits.
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::env::Env;
//!
//! let env = Env::new();
//! let local = env.with_local_cancel();
//!
//! env.cancel();
//! assert!(local.is_cancelled());
//!
//! let shielded = env.uninterruptible();
//! assert!(!shielded.is_cancelled());
//! ```

mod cancel;
mod ledger;

pub use cancel::{CancelSource, CancelToken};
pub use ledger::{Ledger, ResourceKey};

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::effect::Effect;
use crate::error::Result;
use crate::runtime;

/// The ambient bundle of cancellation state, resource scope and thread
/// affinity an effect runs under.
#[derive(Clone)]
pub struct Env {
    token: CancelToken,
    trigger: Option<CancelSource>,
    ledger: Ledger,
    affinity: Option<Handle>,
    timer: Option<AbortHandle>,
}

impl Env {
    /// Creates a top-level environment with a fresh trigger and root ledger.
    #[must_use]
    pub fn new() -> Self {
        let source = CancelSource::new();
        Self {
            token: source.token(),
            trigger: Some(source),
            ledger: Ledger::new(),
            affinity: None,
            timer: None,
        }
    }

    /// Creates a top-level environment pinned to a tokio runtime.
    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            affinity: Some(handle),
            ..Self::new()
        }
    }

    /// The cancellation token observed by this environment.
    #[inline]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The trigger owned by this scope, if any.
    #[inline]
    pub const fn trigger(&self) -> Option<&CancelSource> {
        self.trigger.as_ref()
    }

    /// The resource ledger of this scope.
    #[inline]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The runtime handle forks are spawned on, if pinned.
    #[inline]
    pub const fn affinity(&self) -> Option<&Handle> {
        self.affinity.as_ref()
    }

    /// Returns whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with a cancellation error if cancellation has been requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`](crate::Error::Cancelled) once cancelled.
    #[inline]
    pub fn check(&self) -> Result<()> {
        self.token.check()
    }

    /// Triggers this scope's cancellation. Returns `false` if the scope owns
    /// no trigger (uninterruptible) or was already cancelled.
    pub fn cancel(&self) -> bool {
        self.trigger.as_ref().is_some_and(CancelSource::cancel)
    }

    /// Same cancellation, child resource ledger.
    #[must_use]
    pub fn with_child_ledger(&self) -> Self {
        Self {
            ledger: self.ledger.child(),
            timer: None,
            ..self.clone()
        }
    }

    /// A fresh trigger linked to this environment's token.
    ///
    /// Cancelling the parent cancels the derived environment, never the
    /// reverse.
    #[must_use]
    pub fn with_local_cancel(&self) -> Self {
        self.derive_linked(None).0
    }

    /// Detached cancellation: the derived environment is never cancelled.
    #[must_use]
    pub fn uninterruptible(&self) -> Self {
        Self {
            token: CancelToken::never(),
            trigger: None,
            timer: None,
            ..self.clone()
        }
    }

    /// A linked trigger that also fires once `duration` elapses.
    #[must_use]
    pub fn with_timeout(&self, duration: Duration) -> Self {
        self.derive_linked(Some(duration)).0
    }

    /// Same environment, forks spawned on `handle`.
    #[must_use]
    pub fn with_affinity(&self, handle: Handle) -> Self {
        Self {
            affinity: Some(handle),
            ..self.clone()
        }
    }

    /// Same environment, resources tracked by `ledger`.
    #[must_use]
    pub fn with_ledger(&self, ledger: Ledger) -> Self {
        Self {
            ledger,
            ..self.clone()
        }
    }

    /// Derives a linked environment and returns it with its trigger.
    pub(crate) fn derive_linked(&self, timeout: Option<Duration>) -> (Self, CancelSource) {
        let source = CancelSource::linked(&self.token);
        let timer = timeout.map(|duration| {
            let trigger = source.clone();
            runtime::spawn(self.affinity.as_ref(), async move {
                tokio::time::sleep(duration).await;
                if trigger.cancel() {
                    tracing::debug!(?duration, "timeout elapsed, scope cancelled");
                }
            })
            .abort_handle()
        });
        let derived = Self {
            token: source.token(),
            trigger: Some(source.clone()),
            ledger: self.ledger.clone(),
            affinity: self.affinity.clone(),
            timer,
        };
        (derived, source)
    }

    /// Releases the trigger owned by this scope: unlinks it from the parent
    /// and stops its timer. Idempotent; does not cancel.
    pub fn dispose(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        if let Some(trigger) = &self.trigger {
            trigger.dispose();
        }
    }

    /// Releases every resource still registered in this scope's ledger.
    pub fn release_all(&self) -> Effect<()> {
        self.ledger.release_all()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Env")
            .field("token", &self.token)
            .field("owns_trigger", &self.trigger.is_some())
            .field("ledger", &self.ledger)
            .field("pinned", &self.affinity.is_some())
            .finish()
    }
}

//! Scoped resources.
//!
//! A resource is any value shared through an `Arc`. [`Effect::acquire`]
//! registers its release action in the current environment's ledger once the
//! value has been produced; the resource is released explicitly with
//! [`Effect::release`], or implicitly when the enclosing
//! [`with_resources`](Effect::with_resources) scope exits.

use std::sync::Arc;

use super::Effect;
use super::node::{Node, Value};
use crate::env::{Ledger, ResourceKey};

impl<R: ?Sized + Send + Sync + 'static> Effect<Arc<R>> {
    /// Registers `release` for the acquired resource.
    ///
    /// Registration happens only after the acquiring effect succeeds, in the
    /// ledger of the environment the effect runs under. Acquiring the same
    /// resource twice in one scope keeps the first registration.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicBool, Ordering};
    ///
    /// let closed = Arc::new(AtomicBool::new(false));
    /// let flag = Arc::clone(&closed);
    ///
    /// let connection = Effect::from_fn(|| Ok(Arc::new("connection")))
    ///     .acquire(move |_| {
    ///         let flag = Arc::clone(&flag);
    ///         Effect::from_fn(move || {
    ///             flag.store(true, Ordering::SeqCst);
    ///             Ok(())
    ///         })
    ///     });
    ///
    /// let effect = connection.map(|connection| connection.len()).with_resources();
    /// assert_eq!(effect.run_default(), Ok(10));
    /// assert!(closed.load(Ordering::SeqCst));
    /// ```
    #[must_use]
    pub fn acquire<F>(self, release: F) -> Self
    where
        F: Fn(Arc<R>) -> Effect<()> + Send + Sync + 'static,
    {
        Self::from_node(Node::Acquire {
            source: self.into_node(),
            register: Arc::new(move |value: &Value, ledger: &Ledger| {
                value
                    .downcast_ref::<Arc<R>>()
                    .is_some_and(|resource| ledger.acquire(resource, release(Arc::clone(resource))))
            }),
        })
    }
}

impl Effect<()> {
    /// Releases `resource` if it is registered in the current scope or one of
    /// its parents. Unknown resources are ignored.
    #[must_use]
    pub fn release<R: ?Sized>(resource: &Arc<R>) -> Self {
        Self::from_node(Node::Release(ResourceKey::of(resource)))
    }

    /// Releases every resource registered in the current scope, most recent
    /// first. Individual release failures are logged and skipped.
    #[must_use]
    pub fn release_all() -> Self {
        Effect::env().bind(|env| env.release_all())
    }
}

impl<A: Send + 'static> Effect<A> {
    /// Acquires a value, uses it, and releases it whatever the outcome of the
    /// use.
    ///
    /// The release runs uninterruptibly; its failure surfaces only when the
    /// use succeeded.
    ///
    /// # Arguments
    ///
    /// * `acquire` - Produces the resource.
    /// * `use_resource` - Builds the effect that uses it.
    /// * `release` - Builds the effect that releases it.
    pub fn bracket<R, U, F>(acquire: Effect<R>, use_resource: U, release: F) -> Self
    where
        R: Clone + Send + 'static,
        U: Fn(R) -> Self + Send + Sync + 'static,
        F: Fn(R) -> Effect<()> + Send + Sync + 'static,
    {
        acquire.bind(move |resource: R| use_resource(resource.clone()).finally(release(resource)))
    }
}

//! Composable, lazily evaluated effects.
//!
//! An [`Effect<A>`] describes a computation that, when run under an
//! [`Env`], produces an `A` or fails with an [`Error`]. Building an effect
//! performs no work; running it walks the description with a trampolined
//! interpreter whose stack depth does not grow with the length of the chain.
//!
//! Effects are cheap to clone and may be run any number of times. Unless an
//! effect is memoized (see [`Effect::memo`] and [`Effect::memoize`]), every
//! run performs its side effects again.
//!
//! # Running
//!
//! - [`Effect::run`] drives the effect on the calling thread, blocking on
//!   asynchronous steps.
//! - [`Effect::run_async`] returns a `'static` future for use inside async code.
//! - [`Effect::run_default`] / [`Effect::run_default_async`] create a fresh
//!   environment and release its leftover resources afterwards.
//!
//! The synchronous driver cannot block inside a current-thread tokio runtime;
//! use `run_async` there.
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::effect::Effect;
//! use lambars_effect::env::Env;
//! use lambars_effect::Error;
//!
//! let effect = Effect::pure(20)
//!     .map(|x| x + 1)
//!     .bind(|x| Effect::pure(x * 2));
//! assert_eq!(effect.run(&Env::new()), Ok(42));
//!
//! let recovered = Effect::<i32>::fail(Error::domain("boom"))
//!     .catch(|error| error.message() == Some("boom"), |_| Effect::pure(0));
//! assert_eq!(recovered.run(&Env::new()), Ok(0));
//! ```

mod fork;
mod interpreter;
mod node;
mod resource;
mod retry;

pub use fork::ForkHandle;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::Instrument;

use crate::control::{AsyncThunk, Thunk};
use crate::env::Env;
use crate::error::{Error, Result};
use node::{LocalScope, MemoNode, Node, NodeRef, Value, erase, unbox};

// Fused closures nest, so their call depth is bounded.
const MAX_FUSED_MAPS: u8 = 32;

/// A lazily evaluated, re-runnable description of a computation.
pub struct Effect<A> {
    node: NodeRef,
    _marker: PhantomData<fn() -> A>,
}

static_assertions::assert_impl_all!(Effect<i32>: Send, Sync, Clone);
static_assertions::assert_impl_all!(Effect<std::cell::Cell<i32>>: Send, Sync);

impl<A> Clone for Effect<A> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for Effect<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Effect")
            .field("node", &self.node.name())
            .finish()
    }
}

impl<A> Effect<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self::from_ref(Arc::new(node))
    }

    pub(crate) const fn from_ref(node: NodeRef) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> NodeRef {
        self.node
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl<A: Send + 'static> Effect<A> {
    /// Wraps a value. Every run yields a clone of it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    ///
    /// assert_eq!(Effect::pure("hello").run_default(), Ok("hello"));
    /// ```
    #[must_use]
    pub fn pure(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::Pure(Arc::new(move || erase(value.clone()))))
    }

    /// An effect that always fails with `error`.
    #[must_use]
    pub fn fail(error: impl Into<Error>) -> Self {
        Self::from_node(Node::Fail(error.into()))
    }

    /// An effect that never produces a value; it fails with [`Error::Bottom`].
    #[must_use]
    pub fn never() -> Self {
        Self::from_node(Node::Never)
    }

    /// Lifts a synchronous function of the environment.
    ///
    /// The function runs on every run of the effect. A panic inside it
    /// becomes [`Error::Panicked`].
    ///
    /// # Arguments
    ///
    /// * `function` - Computes the value, or fails, from the current environment.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    ///
    /// let effect = Effect::lift(|env| {
    ///     env.check()?;
    ///     Ok(7)
    /// });
    /// assert_eq!(effect.run_default(), Ok(7));
    /// ```
    pub fn lift<F>(function: F) -> Self
    where
        F: Fn(&Env) -> Result<A> + Send + Sync + 'static,
    {
        Self::from_node(Node::Sync(Arc::new(move |env: &Env| function(env).map(erase))))
    }

    /// Lifts a synchronous function that ignores the environment.
    ///
    /// Like [`lift`](Self::lift), the function runs again on every run.
    ///
    /// # Arguments
    ///
    /// * `function` - Computes the value, or fails.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let calls = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&calls);
    /// let effect = Effect::from_fn(move || Ok(counter.fetch_add(1, Ordering::SeqCst)));
    ///
    /// assert_eq!(effect.run_default(), Ok(0));
    /// assert_eq!(effect.run_default(), Ok(1));
    /// ```
    pub fn from_fn<F>(function: F) -> Self
    where
        F: Fn() -> Result<A> + Send + Sync + 'static,
    {
        Self::lift(move |_| function())
    }

    /// Lifts an asynchronous function of the environment.
    ///
    /// The function receives its own clone of the environment so the returned
    /// future can be `'static`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::time::Duration;
    ///
    /// let effect = Effect::lift_async(|_env| async {
    ///     tokio::time::sleep(Duration::from_millis(1)).await;
    ///     Ok(5)
    /// });
    /// assert_eq!(effect.run_default(), Ok(5));
    /// ```
    pub fn lift_async<F, Fut>(function: F) -> Self
    where
        F: Fn(Env) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A>> + Send + 'static,
    {
        Self::from_node(Node::Async(Arc::new(move |env: Env| {
            function(env).map(|outcome| outcome.map(erase)).boxed()
        })))
    }

    /// Builds the effect to run only when this one runs.
    ///
    /// `factory` is called once per run, so each run may see a different
    /// effect. Use it to postpone construction that reads mutable state.
    ///
    /// # Arguments
    ///
    /// * `factory` - Builds the effect to run.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let built = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&built);
    /// let effect = Effect::defer(move || Effect::pure(counter.fetch_add(1, Ordering::SeqCst)));
    ///
    /// assert_eq!(built.load(Ordering::SeqCst), 0);
    /// assert_eq!(effect.run_default(), Ok(0));
    /// assert_eq!(effect.run_default(), Ok(1));
    /// ```
    pub fn defer<F>(factory: F) -> Self
    where
        F: Fn() -> Self + Send + Sync + 'static,
    {
        Self::from_node(Node::Bind {
            source: Effect::unit().into_node(),
            next: Arc::new(move |_| factory().into_node()),
        })
    }

    /// A memoized synchronous effect: the function runs at most once per
    /// evaluation cycle, across all runs and all threads.
    ///
    /// Later runs read the cached outcome, failures included. Retry, repeat
    /// and fold sessions and [`fresh`](Self::fresh) start a new cycle.
    ///
    /// # Arguments
    ///
    /// * `function` - Computes the value from the environment of the first run.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let calls = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&calls);
    /// let effect = Effect::memo(move |_env| Ok(counter.fetch_add(1, Ordering::SeqCst) + 10));
    ///
    /// assert_eq!(effect.run_default(), Ok(10));
    /// assert_eq!(effect.run_default(), Ok(10));
    /// assert_eq!(calls.load(Ordering::SeqCst), 1);
    /// ```
    pub fn memo<F>(function: F) -> Self
    where
        A: Clone + Sync,
        F: Fn(&Env) -> Result<A> + Send + Sync + 'static,
    {
        Self::from_thunk(Thunk::new(function))
    }

    /// A memoized asynchronous effect.
    ///
    /// Concurrent runs share one evaluation. If the evaluating run is
    /// dropped mid-flight, the cached outcome is [`Error::Cancelled`].
    ///
    /// # Arguments
    ///
    /// * `function` - Starts the computation from the environment of the first run.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let calls = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&calls);
    /// let effect = Effect::memo_async(move |_env| {
    ///     let counter = Arc::clone(&counter);
    ///     async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
    /// });
    ///
    /// assert_eq!(effect.run_default(), Ok(0));
    /// assert_eq!(effect.run_default(), Ok(0));
    /// assert_eq!(calls.load(Ordering::SeqCst), 1);
    /// ```
    pub fn memo_async<F, Fut>(function: F) -> Self
    where
        A: Clone + Sync,
        F: Fn(Env) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A>> + Send + 'static,
    {
        Self::from_async_thunk(AsyncThunk::new(function))
    }

    /// Runs an existing thunk when the effect runs.
    #[must_use]
    pub fn from_thunk(thunk: Thunk<A>) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::Memo(MemoNode::Sync(Arc::new(thunk))))
    }

    /// Runs an existing asynchronous thunk when the effect runs.
    #[must_use]
    pub fn from_async_thunk(thunk: AsyncThunk<A>) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::Memo(MemoNode::Async(Arc::new(thunk))))
    }
}

impl Effect<()> {
    /// The effect that does nothing.
    #[must_use]
    pub fn unit() -> Self {
        Self::pure(())
    }

    /// Waits for `duration`. Fails with [`Error::Cancelled`] as soon as the
    /// environment is cancelled.
    #[must_use]
    pub fn sleep(duration: Duration) -> Self {
        Self::from_node(Node::Sleep(duration))
    }

    /// Triggers cancellation of the current scope.
    #[must_use]
    pub fn cancel() -> Self {
        Self::lift(|env| {
            env.cancel();
            Ok(())
        })
    }
}

impl Effect<bool> {
    /// Reports whether the current environment is cancelled, without failing.
    #[must_use]
    pub fn is_cancelled() -> Self {
        Self::from_node(Node::Inspect(Arc::new(|env: &Env| Ok(erase(env.is_cancelled())))))
    }
}

impl Effect<Env> {
    /// Yields a clone of the current environment.
    #[must_use]
    pub fn env() -> Self {
        Self::lift(|env| Ok(env.clone()))
    }
}

// =============================================================================
// Composition
// =============================================================================

impl<A: Send + 'static> Effect<A> {
    /// Transforms the value.
    ///
    /// Consecutive maps are fused into one step, in groups of bounded size.
    ///
    /// # Arguments
    ///
    /// * `function` - Applied to the value of every successful run.
    ///
    /// # Type Parameters
    ///
    /// * `B` - The new value type.
    /// * `F` - The mapping function.
    #[must_use]
    pub fn map<B, F>(self, function: F) -> Effect<B>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let outer: node::MapFn = Arc::new(move |value: Value| erase(function(unbox::<A>(value))));
        let fused = match &*self.node {
            Node::Map { source, map, fused } if *fused < MAX_FUSED_MAPS => {
                Some((Arc::clone(source), Arc::clone(map), *fused))
            }
            _ => None,
        };
        match fused {
            Some((source, inner, fused)) => Effect::from_node(Node::Map {
                source,
                map: Arc::new(move |value| outer(inner(value))),
                fused: fused + 1,
            }),
            None => Effect::from_node(Node::Map {
                source: self.into_node(),
                map: outer,
                fused: 1,
            }),
        }
    }

    /// Sequences a dependent effect.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    ///
    /// let total = (0..10_000).fold(Effect::pure(0_u64), |effect, _| {
    ///     effect.bind(|n| Effect::pure(n + 1))
    /// });
    /// assert_eq!(total.run_default(), Ok(10_000));
    /// ```
    #[must_use]
    pub fn bind<B, F>(self, function: F) -> Effect<B>
    where
        B: Send + 'static,
        F: Fn(A) -> Effect<B> + Send + Sync + 'static,
    {
        Effect::from_node(Node::Bind {
            source: self.into_node(),
            next: Arc::new(move |value| function(unbox::<A>(value)).into_node()),
        })
    }

    /// Sequences an asynchronous continuation.
    ///
    /// The future returned by `function` is awaited as one step; a panic
    /// while polling it becomes [`Error::Panicked`].
    ///
    /// # Arguments
    ///
    /// * `function` - Starts the next step from the value of `self`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::time::Duration;
    ///
    /// let effect = Effect::pure(20).bind_async(|n| async move {
    ///     tokio::time::sleep(Duration::from_millis(1)).await;
    ///     Ok(n + 1)
    /// });
    /// assert_eq!(effect.run_default(), Ok(21));
    /// ```
    #[must_use]
    pub fn bind_async<B, F, Fut>(self, function: F) -> Effect<B>
    where
        B: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B>> + Send + 'static,
    {
        Effect::from_node(Node::BindAsync {
            source: self.into_node(),
            next: Arc::new(move |value| {
                function(unbox::<A>(value))
                    .map(|outcome| outcome.map(erase))
                    .boxed()
            }),
        })
    }

    /// Runs `next` after `self`, discarding the value of `self`.
    #[must_use]
    pub fn then<B: Send + 'static>(self, next: Effect<B>) -> Effect<B> {
        self.bind(move |_| next.clone())
    }

    /// Applies the function produced by `function` to the value of `self`.
    ///
    /// `function` runs first.
    #[must_use]
    pub fn apply<B, F>(self, function: Effect<F>) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_node(Node::Apply {
            left: function.into_node(),
            right: self.into_node(),
            combine: Arc::new(|function, argument| {
                erase(unbox::<F>(function)(unbox::<A>(argument)))
            }),
        })
    }

    /// Runs both effects in order and combines their values.
    #[must_use]
    pub fn zip_with<B, C, F>(self, other: Effect<B>, function: F) -> Effect<C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        Effect::from_node(Node::Apply {
            left: self.into_node(),
            right: other.into_node(),
            combine: Arc::new(move |left, right| {
                erase(function(unbox::<A>(left), unbox::<B>(right)))
            }),
        })
    }

    /// Runs both effects in order and pairs their values.
    #[must_use]
    pub fn zip<B: Send + 'static>(self, other: Effect<B>) -> Effect<(A, B)> {
        self.zip_with(other, |left, right| (left, right))
    }

    /// Transforms the failure.
    ///
    /// Every failure passes through `function`, cancellation and timeouts
    /// included. Successes are untouched.
    ///
    /// # Arguments
    ///
    /// * `function` - Maps the failure of `self` to the failure to report.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::{Effect, Error};
    ///
    /// let effect = Effect::<u8>::fail(Error::domain("disk full"))
    ///     .map_err(|error| Error::domain(format!("saving report: {error}")));
    /// assert_eq!(effect.run_default(), Err(Error::domain("saving report: disk full")));
    /// ```
    #[must_use]
    pub fn map_err<F>(self, function: F) -> Self
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        self.catch_all(move |error| Self::fail(function(error)))
    }

    /// Handles failures that satisfy `predicate`; others propagate unchanged.
    ///
    /// # Arguments
    ///
    /// * `predicate` - Selects the failures to handle.
    /// * `handler` - Builds the replacement effect from the failure.
    #[must_use]
    pub fn catch<P, H>(self, predicate: P, handler: H) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
        H: Fn(Error) -> Self + Send + Sync + 'static,
    {
        Self::from_node(Node::Catch {
            source: self.into_node(),
            predicate: Arc::new(predicate),
            handler: Arc::new(move |error| handler(error).into_node()),
        })
    }

    /// Handles every failure.
    #[must_use]
    pub fn catch_all<H>(self, handler: H) -> Self
    where
        H: Fn(Error) -> Self + Send + Sync + 'static,
    {
        self.catch(|_| true, handler)
    }

    /// Replaces failures that satisfy `predicate` with a computed value.
    #[must_use]
    pub fn recover<P, F>(self, predicate: P, function: F) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
        F: Fn(Error) -> A + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        self.catch(predicate, move |error| {
            let function = Arc::clone(&function);
            Self::lift(move |_| Ok(function(error.clone())))
        })
    }

    /// Runs `finalizer` after `self` whether it succeeds or fails.
    ///
    /// The finalizer runs uninterruptibly. Its failure replaces a success of
    /// `self`, never a failure.
    #[must_use]
    pub fn finally<B: Send + 'static>(self, finalizer: Effect<B>) -> Self {
        Self::from_node(Node::Finally {
            source: self.into_node(),
            finalizer: finalizer.into_node(),
        })
    }

    fn local_scope(self, scope: LocalScope) -> Self {
        Self::from_node(Node::Local {
            source: self.into_node(),
            scope,
        })
    }

    /// Runs under an environment derived by `function`.
    ///
    /// The derived environment applies to the body only; the outer one is
    /// restored when the body finishes, whatever its outcome.
    ///
    /// # Arguments
    ///
    /// * `function` - Derives the body's environment from the current one.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use lambars_effect::env::Env;
    ///
    /// let effect = Effect::is_cancelled()
    ///     .local(|env: &Env| {
    ///         let derived = env.with_local_cancel();
    ///         derived.cancel();
    ///         derived
    ///     })
    ///     .zip(Effect::is_cancelled());
    /// assert_eq!(effect.run_default(), Ok((true, false)));
    /// ```
    #[must_use]
    pub fn local<F>(self, function: F) -> Self
    where
        F: Fn(&Env) -> Env + Send + Sync + 'static,
    {
        self.local_scope(LocalScope::Map(Arc::new(function)))
    }

    /// Runs with a local cancellation trigger linked to the outer one.
    ///
    /// Cancelling the outer environment cancels the body. Cancelling inside
    /// the body stops the body only, and the trigger is disposed on exit.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::{Effect, Error};
    ///
    /// let effect = Effect::cancel()
    ///     .then(Effect::pure(1))
    ///     .local_cancel()
    ///     .catch(Error::is_cancelled, |_| Effect::pure(0))
    ///     .zip(Effect::is_cancelled());
    /// assert_eq!(effect.run_default(), Ok((0, false)));
    /// ```
    #[must_use]
    pub fn local_cancel(self) -> Self {
        self.local_scope(LocalScope::Cancel)
    }

    /// Runs with cancellation detached: the body is never interrupted.
    #[must_use]
    pub fn uninterruptible(self) -> Self {
        self.local_scope(LocalScope::Uninterruptible)
    }

    /// Runs in a nested resource scope; every resource acquired inside and
    /// not yet released is released when the body finishes.
    #[must_use]
    pub fn with_resources(self) -> Self {
        self.local_scope(LocalScope::Resources)
    }

    /// Pins forks and timers spawned by the body to `handle`.
    #[must_use]
    pub fn on_runtime(self, handle: tokio::runtime::Handle) -> Self {
        self.local(move |env| env.with_affinity(handle.clone()))
    }

    /// Runs inside `span`.
    #[must_use]
    pub fn instrument(self, span: tracing::Span) -> Self {
        Self::lift_async(move |env: Env| self.run_async(&env).instrument(span.clone()))
    }
}

// =============================================================================
// Memoization
// =============================================================================

impl<A: Clone + Send + Sync + 'static> Effect<A> {
    /// Caches the outcome of the first run; later runs, from any thread,
    /// reuse it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let runs = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&runs);
    /// let once = Effect::from_fn(move || Ok(counter.fetch_add(1, Ordering::SeqCst)))
    ///     .memoize();
    ///
    /// assert_eq!(once.run_default(), Ok(0));
    /// assert_eq!(once.run_default(), Ok(0));
    /// assert_eq!(runs.load(Ordering::SeqCst), 1);
    /// ```
    #[must_use]
    pub fn memoize(self) -> Self {
        Self::memo_async(move |env: Env| self.run_async(&env))
    }
}

impl<A> Effect<A> {
    /// A copy whose memoized root, if any, starts unevaluated.
    #[must_use]
    pub fn fresh(&self) -> Self {
        match &*self.node {
            Node::Memo(MemoNode::Sync(thunk)) => Self::from_node(Node::Memo(MemoNode::Sync(thunk.reset()))),
            Node::Memo(MemoNode::Async(thunk)) => {
                Self::from_node(Node::Memo(MemoNode::Async(thunk.reset())))
            }
            _ => self.clone(),
        }
    }
}

// =============================================================================
// Running
// =============================================================================

impl<A: Send + 'static> Effect<A> {
    /// Runs the effect on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the failure of the effect, [`Error::Cancelled`] if `env` is
    /// cancelled, or [`Error::Blocking`] if an asynchronous step cannot be
    /// blocked on from this thread.
    pub fn run(&self, env: &Env) -> Result<A> {
        interpreter::run_sync(Arc::clone(&self.node), env.clone()).map(unbox::<A>)
    }

    /// Runs the effect asynchronously.
    ///
    /// The returned future owns what it needs and can be spawned.
    pub fn run_async(&self, env: &Env) -> impl Future<Output = Result<A>> + Send + use<A> {
        interpreter::run_async(Arc::clone(&self.node), env.clone())
            .map(|outcome| outcome.map(unbox::<A>))
    }

    /// Runs under a fresh environment, then releases whatever resources the
    /// run left registered.
    ///
    /// # Errors
    ///
    /// Returns the failure of the effect.
    pub fn run_default(&self) -> Result<A> {
        let env = Env::new();
        let outcome = self.run(&env);
        // Release failures are logged by the ledger.
        let _ = env.release_all().run(&env.uninterruptible());
        env.dispose();
        outcome
    }

    /// Asynchronous form of [`run_default`](Self::run_default).
    ///
    /// # Errors
    ///
    /// Returns the failure of the effect.
    pub async fn run_default_async(&self) -> Result<A> {
        let env = Env::new();
        let outcome = self.run_async(&env).await;
        let _ = env.release_all().run_async(&env.uninterruptible()).await;
        env.dispose();
        outcome
    }

    /// Runs under a fresh environment and returns the value.
    ///
    /// # Panics
    ///
    /// Panics if the effect fails.
    pub fn run_unsafe(&self) -> A {
        self.run_default()
            .unwrap_or_else(|error| panic!("effect failed: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, Effect<usize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        (
            count,
            Effect::from_fn(move || Ok(shared.fetch_add(1, Ordering::SeqCst))),
        )
    }

    #[rstest]
    fn test_effects_are_lazy_and_re_runnable() {
        let (count, effect) = counting();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let env = Env::new();
        assert_eq!(effect.run(&env), Ok(0));
        assert_eq!(effect.run(&env), Ok(1));
    }

    #[rstest]
    fn test_map_fusion_preserves_order() {
        let effect = Effect::pure(3).map(|x| x + 1).map(|x| x * 10).map(|x| x - 2);
        assert!(matches!(&*effect.node, Node::Map { source, .. } if matches!(&**source, Node::Pure(_))));
        assert_eq!(effect.run(&Env::new()), Ok(38));
    }

    #[rstest]
    fn test_fail_short_circuits_bind() {
        let (count, step) = counting();
        let effect = Effect::<i32>::fail(Error::domain("first")).bind(move |_| step.clone());
        assert_eq!(effect.run(&Env::new()), Err(Error::domain("first")));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn test_never_is_bottom() {
        assert_eq!(Effect::<u8>::never().run(&Env::new()), Err(Error::Bottom));
    }

    #[rstest]
    fn test_panic_in_lift_becomes_failure() {
        let effect: Effect<i32> = Effect::lift(|_| panic!("lifted panic"));
        assert_eq!(
            effect.run(&Env::new()),
            Err(Error::Panicked {
                message: "lifted panic".into()
            })
        );
    }

    #[rstest]
    fn test_panic_in_map_becomes_failure() {
        let effect = Effect::pure(1).map(|_: i32| -> i32 { panic!("mapped panic") });
        assert!(matches!(effect.run(&Env::new()), Err(Error::Panicked { .. })));
    }

    #[rstest]
    fn test_apply_and_zip() {
        let env = Env::new();
        let add_one = Effect::pure(1).apply(Effect::from_fn(|| Ok(|x: i32| x + 1)));
        assert_eq!(add_one.run(&env), Ok(2));

        let pair = Effect::pure("a").zip(Effect::pure(2));
        assert_eq!(pair.run(&env), Ok(("a", 2)));
    }

    #[rstest]
    fn test_catch_predicate_gates_handler() {
        let env = Env::new();
        let handled = Effect::<i32>::fail(Error::domain("expected"))
            .catch(|error| error.message() == Some("expected"), |_| Effect::pure(1));
        assert_eq!(handled.run(&env), Ok(1));

        let passed = Effect::<i32>::fail(Error::domain("other"))
            .catch(|error| error.message() == Some("expected"), |_| Effect::pure(1));
        assert_eq!(passed.run(&env), Err(Error::domain("other")));
    }

    #[rstest]
    fn test_panicking_predicate_surfaces_as_panic() {
        let (count, handler) = counting();
        let effect = Effect::<usize>::fail(Error::domain("inspected"))
            .catch(|_| panic!("predicate exploded"), move |_| handler.clone());

        let error = effect.run(&Env::new()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Panicked);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn test_recover_and_map_err() {
        let env = Env::new();
        let recovered = Effect::<usize>::fail(Error::domain("four"))
            .recover(|_| true, |error| error.to_string().len());
        assert_eq!(recovered.run(&env), Ok(4));

        let mapped = Effect::<()>::fail(Error::domain("inner"))
            .map_err(|error| Error::domain(format!("outer: {error}")));
        assert_eq!(mapped.run(&env), Err(Error::domain("outer: inner")));
    }

    #[rstest]
    fn test_finally_runs_on_both_paths() {
        let env = Env::new();
        let (count, finalizer) = counting();

        assert_eq!(Effect::pure(1).finally(finalizer.clone()).run(&env), Ok(1));
        assert_eq!(
            Effect::<i32>::fail(Error::domain("x"))
                .finally(finalizer)
                .run(&env),
            Err(Error::domain("x"))
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    fn test_finally_failure_replaces_success_only() {
        let env = Env::new();
        let failing = Effect::<()>::fail(Error::domain("cleanup"));

        assert_eq!(
            Effect::pure(1).finally(failing.clone()).run(&env),
            Err(Error::domain("cleanup"))
        );
        assert_eq!(
            Effect::<i32>::fail(Error::domain("body"))
                .finally(failing)
                .run(&env),
            Err(Error::domain("body"))
        );
    }

    #[rstest]
    fn test_cancelled_env_stops_before_first_step() {
        let (count, effect) = counting();
        let env = Env::new();
        env.cancel();

        assert_eq!(effect.run(&env), Err(Error::Cancelled));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(Effect::is_cancelled().run(&env), Ok(true));
    }

    #[rstest]
    fn test_finally_installed_in_cancelled_env_still_runs() {
        let env = Env::new();
        env.cancel();
        let (count, finalizer) = counting();

        assert_eq!(
            Effect::pure(1).finally(finalizer).run(&env),
            Err(Error::Cancelled)
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_uninterruptible_ignores_cancellation() {
        let env = Env::new();
        env.cancel();
        assert_eq!(Effect::pure(5).uninterruptible().run(&env), Ok(5));
    }

    #[rstest]
    fn test_cancel_effect_stops_remaining_steps() {
        let (count, step) = counting();
        let effect = Effect::cancel().then(step);

        assert_eq!(effect.run(&Env::new()), Err(Error::Cancelled));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn test_local_cancel_does_not_leak_outwards() {
        let env = Env::new();
        let effect = Effect::cancel()
            .then(Effect::pure(1))
            .local_cancel()
            .catch(Error::is_cancelled, |_| Effect::pure(0))
            .map(|value| value + 10);

        assert_eq!(effect.run(&env), Ok(10));
        assert!(!env.is_cancelled());
    }

    #[rstest]
    fn test_memo_runs_once_and_fresh_resets() {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let memo = Effect::memo(move |_| Ok(shared.fetch_add(1, Ordering::SeqCst)));
        let env = Env::new();

        assert_eq!(memo.run(&env), Ok(0));
        assert_eq!(memo.clone().run(&env), Ok(0));
        assert_eq!(memo.fresh().run(&env), Ok(1));
        assert_eq!(memo.run(&env), Ok(0));
    }

    #[rstest]
    fn test_defer_builds_lazily() {
        let built = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&built);
        let effect = Effect::defer(move || {
            shared.fetch_add(1, Ordering::SeqCst);
            Effect::pure(2)
        });
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert_eq!(effect.run(&Env::new()), Ok(2));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_run_async_inside_current_thread_runtime() {
        let effect = Effect::sleep(Duration::from_millis(5)).then(Effect::pure(9));
        assert_eq!(effect.run_async(&Env::new()).await, Ok(9));
    }

    #[rstest]
    #[tokio::test]
    async fn test_sync_run_reports_blocking_inside_current_thread_runtime() {
        let effect = Effect::sleep(Duration::from_millis(1));
        assert!(matches!(effect.run(&Env::new()), Err(Error::Blocking(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn test_bind_async() {
        let effect = Effect::pure(4).bind_async(|value| async move {
            tokio::task::yield_now().await;
            Ok(value * 3)
        });
        assert_eq!(effect.run_default_async().await, Ok(12));
    }

    #[rstest]
    fn test_run_unsafe_returns_value() {
        assert_eq!(Effect::pure(11).run_unsafe(), 11);
    }

    #[rstest]
    #[should_panic(expected = "effect failed")]
    fn test_run_unsafe_panics_on_failure() {
        let _ = Effect::<i32>::fail(Error::domain("nope")).run_unsafe();
    }
}

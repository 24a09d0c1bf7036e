//! The asynchronous counterpart of [`Thunk`](super::Thunk).
//!
//! Waiting callers yield to the tokio scheduler instead of spinning. If the
//! caller that won the evaluation is dropped before the function completes,
//! the thunk settles as `Cancelled` so waiters are never stranded; a later
//! [`re_value`](AsyncThunk::re_value) can retry.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use super::state::{StateCell, ThunkState};
use super::thunk::terminal_state_of;
use crate::env::Env;
use crate::error::{Error, Result};

/// The function evaluated by an [`AsyncThunk`].
pub type AsyncThunkFn<A> = Arc<dyn Fn(Env) -> BoxFuture<'static, Result<A>> + Send + Sync>;

struct AsyncThunkCell<A> {
    state: StateCell,
    outcome: RwLock<Option<Result<A>>>,
    function: Option<AsyncThunkFn<A>>,
}

/// Settles the cell as `Cancelled` if the evaluating future is dropped early.
struct SettleOnDrop<'a, A> {
    cell: &'a AsyncThunkCell<A>,
    armed: bool,
}

impl<A> Drop for SettleOnDrop<'_, A> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("thunk evaluation abandoned");
            *self.cell.outcome.write() = Some(Err(Error::Cancelled));
            self.cell.state.publish(ThunkState::Cancelled);
        }
    }
}

impl<A: Clone + Send + Sync + 'static> AsyncThunkCell<A> {
    fn pending(function: AsyncThunkFn<A>) -> Self {
        Self {
            state: StateCell::new(ThunkState::NotEvaluated),
            outcome: RwLock::new(None),
            function: Some(function),
        }
    }

    fn settled(outcome: Result<A>) -> Self {
        Self {
            state: StateCell::new(terminal_state_of(&outcome)),
            outcome: RwLock::new(Some(outcome)),
            function: None,
        }
    }

    fn read(&self) -> Result<A> {
        self.outcome.read().clone().unwrap_or(Err(Error::Bottom))
    }

    async fn value(&self, env: Env) -> Result<A> {
        loop {
            match self.state.load() {
                state if state.is_terminal() => return self.read(),
                ThunkState::NotEvaluated => {
                    if self.state.begin(ThunkState::NotEvaluated) {
                        return self.evaluate(env).await;
                    }
                }
                _ => tokio::task::yield_now().await,
            }
        }
    }

    async fn re_value(&self, env: Env) -> Result<A> {
        if self.function.is_none() {
            return self.read();
        }
        loop {
            match self.state.load() {
                ThunkState::Evaluating => {
                    while self.state.load() == ThunkState::Evaluating {
                        tokio::task::yield_now().await;
                    }
                    return self.read();
                }
                state => {
                    if self.state.begin(state) {
                        return self.evaluate(env).await;
                    }
                }
            }
        }
    }

    async fn evaluate(&self, env: Env) -> Result<A> {
        let mut guard = SettleOnDrop {
            cell: self,
            armed: true,
        };
        let outcome = match &self.function {
            Some(function) => AssertUnwindSafe(function(env))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let error = Error::panicked(payload.as_ref());
                    tracing::warn!(%error, "async thunk function panicked");
                    Err(error)
                }),
            None => Err(Error::Bottom),
        };
        guard.armed = false;
        let state = terminal_state_of(&outcome);
        *self.outcome.write() = Some(outcome.clone());
        self.state.publish(state);
        outcome
    }
}

/// A lazily evaluated, memoized asynchronous computation.
///
/// Same contract as [`Thunk`](super::Thunk): at most one evaluation per
/// cycle, cached failures, a distinct `Cancelled` state, and cloning resets
/// function-backed thunks.
pub struct AsyncThunk<A> {
    cell: Arc<AsyncThunkCell<A>>,
}

impl<A> AsyncThunk<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates an unevaluated thunk.
    pub fn new<F, Fut>(function: F) -> Self
    where
        F: Fn(Env) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A>> + Send + 'static,
    {
        Self::from_fn(Arc::new(move |env| function(env).boxed()))
    }

    /// Creates an unevaluated thunk from a shared function.
    #[must_use]
    pub fn from_fn(function: AsyncThunkFn<A>) -> Self {
        Self {
            cell: Arc::new(AsyncThunkCell::pending(function)),
        }
    }

    /// A thunk already holding `value`.
    #[must_use]
    pub fn success(value: A) -> Self {
        Self {
            cell: Arc::new(AsyncThunkCell::settled(Ok(value))),
        }
    }

    /// A thunk already holding `error`.
    #[must_use]
    pub fn fail(error: Error) -> Self {
        Self {
            cell: Arc::new(AsyncThunkCell::settled(Err(error))),
        }
    }

    /// A thunk already in the `Cancelled` state.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::fail(Error::Cancelled)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ThunkState {
        self.cell.state.load()
    }

    /// Returns the cached outcome, evaluating first if nobody has yet.
    ///
    /// The returned future owns everything it needs and may outlive `self`.
    pub fn value(&self, env: &Env) -> impl Future<Output = Result<A>> + Send + use<A> {
        let cell = Arc::clone(&self.cell);
        let env = env.clone();
        async move { cell.value(env).await }
    }

    /// Forces a fresh evaluation from any terminal state.
    pub fn re_value(&self, env: &Env) -> impl Future<Output = Result<A>> + Send + use<A> {
        let cell = Arc::clone(&self.cell);
        let env = env.clone();
        async move { cell.re_value(env).await }
    }

    /// Maps the success value with an asynchronous function.
    #[must_use]
    pub fn map_async<B, F, Fut>(&self, function: F) -> AsyncThunk<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = B> + Send + 'static,
    {
        let source = Arc::clone(&self.cell);
        let function = Arc::new(function);
        AsyncThunk::new(move |env| {
            let source = Arc::clone(&source);
            let function = Arc::clone(&function);
            async move {
                let value = source.value(env).await?;
                Ok(function(value).await)
            }
        })
    }

    /// Maps the success value.
    #[must_use]
    pub fn map<B, F>(&self, function: F) -> AsyncThunk<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        self.map_async(move |value| {
            let function = Arc::clone(&function);
            async move { function(value) }
        })
    }

    /// Maps the success value and the failure of a `Failed` thunk with
    /// asynchronous functions. Cancellation is left untouched.
    #[must_use]
    pub fn bi_map_async<B, F, FutB, G, FutE>(&self, on_success: F, on_failure: G) -> AsyncThunk<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> FutB + Send + Sync + 'static,
        FutB: Future<Output = B> + Send + 'static,
        G: Fn(Error) -> FutE + Send + Sync + 'static,
        FutE: Future<Output = Error> + Send + 'static,
    {
        let source = Arc::clone(&self.cell);
        let on_success = Arc::new(on_success);
        let on_failure = Arc::new(on_failure);
        AsyncThunk::new(move |env| {
            let source = Arc::clone(&source);
            let on_success = Arc::clone(&on_success);
            let on_failure = Arc::clone(&on_failure);
            async move {
                match source.value(env).await {
                    Ok(value) => Ok(on_success(value).await),
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(error) => Err(on_failure(error).await),
                }
            }
        })
    }

    /// Maps the success value and the failure of a `Failed` thunk.
    #[must_use]
    pub fn bi_map<B, F, G>(&self, on_success: F, on_failure: G) -> AsyncThunk<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
        G: Fn(Error) -> Error + Send + Sync + 'static,
    {
        let on_success = Arc::new(on_success);
        let on_failure = Arc::new(on_failure);
        self.bi_map_async(
            move |value| {
                let on_success = Arc::clone(&on_success);
                async move { on_success(value) }
            },
            move |error| {
                let on_failure = Arc::clone(&on_failure);
                async move { on_failure(error) }
            },
        )
    }
}

impl<A: Clone + Send + Sync + 'static> Clone for AsyncThunk<A> {
    fn clone(&self) -> Self {
        match &self.cell.function {
            Some(function) => Self::from_fn(Arc::clone(function)),
            None => Self {
                cell: Arc::clone(&self.cell),
            },
        }
    }
}

impl<A> fmt::Debug for AsyncThunk<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AsyncThunk")
            .field("state", &self.cell.state.load())
            .finish_non_exhaustive()
    }
}

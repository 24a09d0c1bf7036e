//! Thread-safe, at-most-once memoized computations.
//!
//! A [`Thunk`] runs its function at most once per evaluation cycle no matter
//! how many threads ask for the value at the same time. The winner of an
//! atomic compare-and-swap evaluates; everyone else waits with exponential
//! backoff and reads the cached outcome.
//!
//! Unlike a plain lazy value, a thunk caches *failures* too, distinguishes
//! cancellation from failure, and can be forced to evaluate again with
//! [`Thunk::re_value`].
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::control::{Thunk, ThunkState};
//! use lambars_effect::env::Env;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let runs = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&runs);
//! let thunk = Thunk::new(move |_| Ok(counter.fetch_add(1, Ordering::SeqCst) + 1));
//! let env = Env::new();
//!
//! assert_eq!(thunk.value(&env), Ok(1));
//! assert_eq!(thunk.value(&env), Ok(1));
//! assert_eq!(thunk.state(), ThunkState::Success);
//!
//! assert_eq!(thunk.re_value(&env), Ok(2));
//! assert_eq!(runs.load(Ordering::SeqCst), 2);
//! ```

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;

use super::state::{Backoff, StateCell, ThunkState};
use crate::env::Env;
use crate::error::{Error, Result};

/// The function evaluated by a [`Thunk`].
pub type ThunkFn<A> = Arc<dyn Fn(&Env) -> Result<A> + Send + Sync>;

pub(crate) fn terminal_state_of<A>(outcome: &Result<A>) -> ThunkState {
    match outcome {
        Ok(_) => ThunkState::Success,
        Err(error) if error.is_cancelled() => ThunkState::Cancelled,
        Err(_) => ThunkState::Failed,
    }
}

struct ThunkCell<A> {
    state: StateCell,
    // Written only by the evaluation winner, read only in terminal states.
    outcome: RwLock<Option<Result<A>>>,
    function: Option<ThunkFn<A>>,
}

impl<A: Clone> ThunkCell<A> {
    fn pending(function: ThunkFn<A>) -> Self {
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

    fn value(&self, env: &Env) -> Result<A> {
        let mut backoff = Backoff::new();
        loop {
            match self.state.load() {
                state if state.is_terminal() => return self.read(),
                ThunkState::NotEvaluated => {
                    if self.state.begin(ThunkState::NotEvaluated) {
                        return self.evaluate(env);
                    }
                }
                _ => backoff.snooze(),
            }
        }
    }

    fn re_value(&self, env: &Env) -> Result<A> {
        if self.function.is_none() {
            return self.read();
        }
        let mut backoff = Backoff::new();
        loop {
            match self.state.load() {
                ThunkState::Evaluating => {
                    // Someone else is already producing a fresh outcome.
                    while self.state.load() == ThunkState::Evaluating {
                        backoff.snooze();
                    }
                    return self.read();
                }
                state => {
                    if self.state.begin(state) {
                        return self.evaluate(env);
                    }
                }
            }
        }
    }

    fn evaluate(&self, env: &Env) -> Result<A> {
        let outcome = match &self.function {
            Some(function) => catch_unwind(AssertUnwindSafe(|| function(env))).unwrap_or_else(
                |payload| {
                    let error = Error::panicked(payload.as_ref());
                    tracing::warn!(%error, "thunk function panicked");
                    Err(error)
                },
            ),
            None => Err(Error::Bottom),
        };
        let state = terminal_state_of(&outcome);
        *self.outcome.write() = Some(outcome.clone());
        self.state.publish(state);
        outcome
    }
}

/// A lazily evaluated, thread-safe, memoized computation.
///
/// Cloning a function-backed thunk yields a fresh, unevaluated thunk with
/// the same function. Cloning a settled thunk built with
/// [`success`](Self::success) or [`failure`](Self::failure) shares its
/// outcome.
pub struct Thunk<A> {
    cell: Arc<ThunkCell<A>>,
}

impl<A> Thunk<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates an unevaluated thunk.
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&Env) -> Result<A> + Send + Sync + 'static,
    {
        Self::from_fn(Arc::new(function))
    }

    /// Creates an unevaluated thunk from a shared function.
    #[must_use]
    pub fn from_fn(function: ThunkFn<A>) -> Self {
        Self {
            cell: Arc::new(ThunkCell::pending(function)),
        }
    }

    /// A thunk already holding `value`.
    #[must_use]
    pub fn success(value: A) -> Self {
        Self {
            cell: Arc::new(ThunkCell::settled(Ok(value))),
        }
    }

    /// A thunk already holding `error`. A cancellation error yields the
    /// `Cancelled` state.
    #[must_use]
    pub fn fail(error: Error) -> Self {
        Self {
            cell: Arc::new(ThunkCell::settled(Err(error))),
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

    /// Returns the cached outcome, evaluating the function first if no
    /// caller has done so yet.
    ///
    /// # Errors
    ///
    /// Returns the cached failure, or [`Error::Cancelled`] if the evaluation
    /// observed cancellation.
    pub fn value(&self, env: &Env) -> Result<A> {
        self.cell.value(env)
    }

    /// Forces a fresh evaluation from any terminal state.
    ///
    /// Concurrent callers still observe a single evaluation. Settled thunks
    /// without a function return their outcome unchanged.
    ///
    /// # Errors
    ///
    /// Returns the failure of the fresh evaluation.
    pub fn re_value(&self, env: &Env) -> Result<A> {
        self.cell.re_value(env)
    }

    /// Maps the success value. The source is evaluated at most once.
    #[must_use]
    pub fn map<B, F>(&self, function: F) -> Thunk<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let source = Arc::clone(&self.cell);
        Thunk::new(move |env| source.value(env).map(&function))
    }

    /// Maps the failure of a `Failed` thunk. Cancellation is left untouched.
    #[must_use]
    pub fn map_err<F>(&self, function: F) -> Self
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        self.bi_map(|value| value, function)
    }

    /// Maps the success value and the failure of a `Failed` thunk.
    #[must_use]
    pub fn bi_map<B, F, G>(&self, on_success: F, on_failure: G) -> Thunk<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
        G: Fn(Error) -> Error + Send + Sync + 'static,
    {
        let source = Arc::clone(&self.cell);
        Thunk::new(move |env| match source.value(env) {
            Ok(value) => Ok(on_success(value)),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(error) => Err(on_failure(error)),
        })
    }
}

impl<A: Clone> Clone for Thunk<A> {
    fn clone(&self) -> Self {
        match &self.cell.function {
            Some(function) => Self {
                cell: Arc::new(ThunkCell::pending(Arc::clone(function))),
            },
            None => Self {
                cell: Arc::clone(&self.cell),
            },
        }
    }
}

impl<A: Clone + fmt::Debug> fmt::Debug for Thunk<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cell.state.load();
        let mut debug = formatter.debug_struct("Thunk");
        debug.field("state", &state);
        if state.is_terminal() {
            debug.field("outcome", &self.cell.read());
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(runs: &Arc<AtomicUsize>) -> Thunk<usize> {
        let runs = Arc::clone(runs);
        Thunk::new(move |_| Ok(runs.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[rstest]
    fn test_failure_is_cached() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let thunk: Thunk<i32> = Thunk::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::domain("nope"))
        });
        let env = Env::new();

        assert_eq!(thunk.value(&env), Err(Error::domain("nope")));
        assert_eq!(thunk.value(&env), Err(Error::domain("nope")));
        assert_eq!(thunk.state(), ThunkState::Failed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_cancellation_is_distinct_state() {
        let thunk: Thunk<i32> = Thunk::new(|env| {
            env.check()?;
            Ok(1)
        });
        let env = Env::new();
        env.cancel();

        assert_eq!(thunk.value(&env), Err(Error::Cancelled));
        assert_eq!(thunk.state(), ThunkState::Cancelled);

        assert_eq!(thunk.re_value(&Env::new()), Ok(1));
        assert_eq!(thunk.state(), ThunkState::Success);
    }

    #[rstest]
    fn test_panic_becomes_failure() {
        let thunk: Thunk<i32> = Thunk::new(|_| panic!("exploded"));
        let outcome = thunk.value(&Env::new());

        assert_eq!(
            outcome,
            Err(Error::Panicked {
                message: "exploded".into()
            })
        );
        assert_eq!(thunk.state(), ThunkState::Failed);
    }

    #[rstest]
    fn test_clone_resets_function_backed_thunk() {
        let runs = Arc::new(AtomicUsize::new(0));
        let thunk = counting(&runs);
        let env = Env::new();

        assert_eq!(thunk.value(&env), Ok(1));
        let copy = thunk.clone();
        assert_eq!(copy.state(), ThunkState::NotEvaluated);
        assert_eq!(copy.value(&env), Ok(2));
    }

    #[rstest]
    fn test_settled_thunks() {
        let env = Env::new();
        let success = Thunk::success(7);
        assert_eq!(success.state(), ThunkState::Success);
        assert_eq!(success.clone().value(&env), Ok(7));
        assert_eq!(success.re_value(&env), Ok(7));

        assert_eq!(Thunk::<i32>::cancelled().state(), ThunkState::Cancelled);
        assert_eq!(
            Thunk::<i32>::fail(Error::domain("x")).state(),
            ThunkState::Failed
        );
    }

    #[rstest]
    fn test_map_reads_source_through_cache() {
        let runs = Arc::new(AtomicUsize::new(0));
        let source = counting(&runs);
        let env = Env::new();

        assert_eq!(source.value(&env), Ok(1));
        let doubled = source.map(|value| value * 2);

        assert_eq!(doubled.value(&env), Ok(2));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_bi_map_keeps_cancellation() {
        let env = Env::new();
        let cancelled = Thunk::<i32>::cancelled().bi_map(|v| v, |_| Error::domain("mapped"));
        assert_eq!(cancelled.value(&env), Err(Error::Cancelled));

        let failed = Thunk::<i32>::fail(Error::domain("raw")).map_err(|error| {
            Error::domain(format!("wrapped: {error}"))
        });
        assert_eq!(failed.value(&env), Err(Error::domain("wrapped: raw")));
    }
}

//! Schedule-driven repetition: `retry`, `repeat` and `fold`.
//!
//! Each run of a scheduled effect opens a session that sees every outcome
//! and decides whether to go again. The [`Schedule`] decides *how often* and
//! *how long to pause*; the session decides *whether* and *what to return*.
//!
//! | mode   | continues on            | result when the schedule runs out |
//! |--------|-------------------------|-----------------------------------|
//! | retry  | failure matching filter | the last failure                  |
//! | repeat | success matching filter | the last value                    |
//! | fold   | success, state filter   | the folded state                  |
//!
//! Cancellation ends a session immediately in every mode. Iterations after
//! the first re-evaluate memoized effects instead of reading their cache,
//! including a memo wrapped by `map`, `bind`, `catch` or a scope.

use std::marker::PhantomData;
use std::sync::Arc;

use super::Effect;
use super::node::{Node, Outcome, Value, erase, unbox};
use crate::error::Error;
use crate::schedule::Schedule;

/// What a session wants after seeing an outcome.
pub(crate) enum Step {
    Continue,
    Stop(Outcome),
}

pub(crate) trait ScheduleSession: Send {
    fn feed(&mut self, outcome: Outcome) -> Step;
    /// Called when the schedule has no delays left after a `Continue`.
    fn exhausted(&mut self) -> Outcome;
}

pub(crate) trait SchedulePolicy: Send + Sync {
    fn start(&self) -> Box<dyn ScheduleSession>;
}

// =============================================================================
// Repeat
// =============================================================================

type ValuePredicate<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;

struct RepeatPolicy<A> {
    predicate: ValuePredicate<A>,
}

struct RepeatSession<A> {
    predicate: ValuePredicate<A>,
    last: Option<Value>,
}

impl<A: Send + 'static> SchedulePolicy for RepeatPolicy<A> {
    fn start(&self) -> Box<dyn ScheduleSession> {
        Box::new(RepeatSession::<A> {
            predicate: Arc::clone(&self.predicate),
            last: None,
        })
    }
}

impl<A: Send + 'static> ScheduleSession for RepeatSession<A> {
    fn feed(&mut self, outcome: Outcome) -> Step {
        match outcome {
            Ok(value) => {
                if value
                    .downcast_ref::<A>()
                    .is_some_and(|typed| (self.predicate)(typed))
                {
                    self.last = Some(value);
                    Step::Continue
                } else {
                    Step::Stop(Ok(value))
                }
            }
            Err(error) => Step::Stop(Err(error)),
        }
    }

    fn exhausted(&mut self) -> Outcome {
        self.last.take().ok_or(Error::Bottom)
    }
}

// =============================================================================
// Retry
// =============================================================================

type ErrorPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

struct RetryPolicy {
    predicate: ErrorPredicate,
}

struct RetrySession {
    predicate: ErrorPredicate,
    last: Option<Error>,
}

impl SchedulePolicy for RetryPolicy {
    fn start(&self) -> Box<dyn ScheduleSession> {
        Box::new(RetrySession {
            predicate: Arc::clone(&self.predicate),
            last: None,
        })
    }
}

impl ScheduleSession for RetrySession {
    fn feed(&mut self, outcome: Outcome) -> Step {
        match outcome {
            Err(error) if (self.predicate)(&error) => {
                tracing::debug!(%error, "attempt failed, retrying");
                self.last = Some(error);
                Step::Continue
            }
            outcome => Step::Stop(outcome),
        }
    }

    fn exhausted(&mut self) -> Outcome {
        let error = self.last.take().unwrap_or(Error::Bottom);
        tracing::debug!(%error, "retries exhausted");
        Err(error)
    }
}

// =============================================================================
// Fold
// =============================================================================

struct FoldPolicy<S, A> {
    initial: S,
    folder: Arc<dyn Fn(S, A) -> S + Send + Sync>,
    predicate: ValuePredicate<S>,
}

struct FoldSession<S, A> {
    state: Option<S>,
    folder: Arc<dyn Fn(S, A) -> S + Send + Sync>,
    predicate: ValuePredicate<S>,
    _marker: PhantomData<fn(A)>,
}

impl<S, A> SchedulePolicy for FoldPolicy<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    fn start(&self) -> Box<dyn ScheduleSession> {
        Box::new(FoldSession {
            state: Some(self.initial.clone()),
            folder: Arc::clone(&self.folder),
            predicate: Arc::clone(&self.predicate),
            _marker: PhantomData,
        })
    }
}

impl<S, A> ScheduleSession for FoldSession<S, A>
where
    S: Send + 'static,
    A: Send + 'static,
{
    fn feed(&mut self, outcome: Outcome) -> Step {
        let value = match outcome {
            Ok(value) => unbox::<A>(value),
            Err(error) => return Step::Stop(Err(error)),
        };
        let Some(state) = self.state.take() else {
            return Step::Stop(Err(Error::Bottom));
        };
        let state = (self.folder)(state, value);
        if (self.predicate)(&state) {
            self.state = Some(state);
            Step::Continue
        } else {
            Step::Stop(Ok(erase(state)))
        }
    }

    fn exhausted(&mut self) -> Outcome {
        self.state.take().map(erase).ok_or(Error::Bottom)
    }
}

// =============================================================================
// Effect surface
// =============================================================================

impl<A: Send + 'static> Effect<A> {
    fn scheduled<B>(self, schedule: Schedule, policy: Arc<dyn SchedulePolicy>) -> Effect<B> {
        Effect::from_node(Node::Schedule {
            source: self.into_node(),
            schedule,
            policy,
        })
    }

    /// Re-runs the effect after every failure until it succeeds or the
    /// schedule runs out. Returns the first success or the last failure.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use lambars_effect::schedule::Schedule;
    /// use lambars_effect::Error;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let attempts = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&attempts);
    /// let flaky = Effect::from_fn(move || {
    ///     if counter.fetch_add(1, Ordering::SeqCst) < 2 {
    ///         Err(Error::domain("not yet"))
    ///     } else {
    ///         Ok("ready")
    ///     }
    /// });
    ///
    /// assert_eq!(flaky.retry(Schedule::recurs(5)).run_default(), Ok("ready"));
    /// assert_eq!(attempts.load(Ordering::SeqCst), 3);
    /// ```
    #[must_use]
    pub fn retry(self, schedule: Schedule) -> Self {
        self.retry_while(schedule, |_| true)
    }

    /// Retries only while failures satisfy `predicate`.
    #[must_use]
    pub fn retry_while<P>(self, schedule: Schedule, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.scheduled(
            schedule,
            Arc::new(RetryPolicy {
                predicate: Arc::new(predicate),
            }),
        )
    }

    /// Retries until a failure satisfies `predicate`.
    #[must_use]
    pub fn retry_until<P>(self, schedule: Schedule, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_while(schedule, move |error| !predicate(error))
    }

    /// Re-runs the effect after every success until the schedule runs out.
    /// Returns the last value; the first failure ends the session.
    #[must_use]
    pub fn repeat(self, schedule: Schedule) -> Self {
        self.repeat_while(schedule, |_| true)
    }

    /// Repeats only while values satisfy `predicate`.
    #[must_use]
    pub fn repeat_while<P>(self, schedule: Schedule, predicate: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.scheduled(
            schedule,
            Arc::new(RepeatPolicy::<A> {
                predicate: Arc::new(predicate),
            }),
        )
    }

    /// Repeats until a value satisfies `predicate`.
    #[must_use]
    pub fn repeat_until<P>(self, schedule: Schedule, predicate: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.repeat_while(schedule, move |value| !predicate(value))
    }

    /// Re-runs the effect on a schedule, folding every value into a state.
    ///
    /// The first failure ends the session and is returned; the partial state
    /// is discarded.
    #[must_use]
    pub fn fold<S, F>(self, schedule: Schedule, initial: S, folder: F) -> Effect<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        self.fold_while(schedule, initial, folder, |_| true)
    }

    /// Folds while the state satisfies `predicate`.
    #[must_use]
    pub fn fold_while<S, F, P>(
        self,
        schedule: Schedule,
        initial: S,
        folder: F,
        predicate: P,
    ) -> Effect<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(S, A) -> S + Send + Sync + 'static,
        P: Fn(&S) -> bool + Send + Sync + 'static,
    {
        self.scheduled(
            schedule,
            Arc::new(FoldPolicy::<S, A> {
                initial,
                folder: Arc::new(folder),
                predicate: Arc::new(predicate),
            }),
        )
    }

    /// Folds until the state satisfies `predicate`.
    #[must_use]
    pub fn fold_until<S, F, P>(
        self,
        schedule: Schedule,
        initial: S,
        folder: F,
        predicate: P,
    ) -> Effect<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(S, A) -> S + Send + Sync + 'static,
        P: Fn(&S) -> bool + Send + Sync + 'static,
    {
        self.fold_while(schedule, initial, folder, move |state| !predicate(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, Effect<usize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let effect = Effect::from_fn(move || Ok(shared.fetch_add(1, Ordering::SeqCst) + 1));
        (count, effect)
    }

    #[rstest]
    fn test_repeat_returns_last_value() {
        let (count, effect) = counter();
        assert_eq!(effect.repeat(Schedule::recurs(4)).run(&Env::new()), Ok(5));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[rstest]
    fn test_repeat_until_stops_early() {
        let (count, effect) = counter();
        let result = effect
            .repeat_until(Schedule::forever(), |value| *value == 3)
            .run(&Env::new());
        assert_eq!(result, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[rstest]
    fn test_repeat_stops_on_failure() {
        let (count, effect) = counter();
        let result = effect
            .bind(|value| {
                if value == 2 {
                    Effect::fail(Error::domain("second run"))
                } else {
                    Effect::pure(value)
                }
            })
            .repeat(Schedule::recurs(10))
            .run(&Env::new());
        assert_eq!(result, Err(Error::domain("second run")));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    fn test_retry_while_gates_on_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&attempts);
        let effect: Effect<()> = Effect::from_fn(move || {
            shared.fetch_add(1, Ordering::SeqCst);
            Err(Error::timeout(Duration::from_millis(1)))
        });

        let result = effect
            .retry_while(Schedule::recurs(10), |error| !error.is_timeout())
            .run(&Env::new());

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_retry_does_not_rerun_success() {
        let (count, effect) = counter();
        assert_eq!(effect.retry(Schedule::recurs(3)).run(&Env::new()), Ok(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_fold_sums_iterations() {
        let (_, effect) = counter();
        let total = effect
            .fold(Schedule::recurs(3), 0, |sum, value| sum + value)
            .run(&Env::new());
        assert_eq!(total, Ok(1 + 2 + 3 + 4));
    }

    #[rstest]
    fn test_fold_until_stops_on_state() {
        let (count, effect) = counter();
        let total = effect
            .fold_until(Schedule::forever(), 0, |sum, value| sum + value, |sum| *sum >= 6)
            .run(&Env::new());
        assert_eq!(total, Ok(6));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[rstest]
    fn test_memoized_source_is_re_evaluated() {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let memoized = Effect::memo(move |_| Ok(shared.fetch_add(1, Ordering::SeqCst)));

        let result = memoized.repeat(Schedule::recurs(2)).run(&Env::new());

        assert_eq!(result, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[rstest]
    fn test_cancellation_ends_retry_immediately() {
        let env = Env::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&attempts);
        let trigger = env.clone();
        let effect: Effect<()> = Effect::from_fn(move || {
            shared.fetch_add(1, Ordering::SeqCst);
            trigger.cancel();
            Err(Error::domain("failed after cancelling"))
        });

        let result = effect.retry(Schedule::forever()).run(&env);

        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

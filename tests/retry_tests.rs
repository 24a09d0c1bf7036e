use lambars_effect::prelude::*;
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn counted<A, F>(body: F) -> (Arc<AtomicUsize>, Effect<A>)
where
    A: Send + 'static,
    F: Fn(usize) -> Result<A> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let effect = Effect::from_fn(move || body(counter.fetch_add(1, Ordering::SeqCst)));
    (calls, effect)
}

// =============================================================================
// Retry
// =============================================================================

#[rstest]
fn retry_until_never_satisfied_returns_last_error_after_all_attempts() {
    let (calls, effect) =
        counted::<(), _>(|attempt| Err(Error::domain(format!("attempt {attempt}"))));

    let outcome = effect
        .retry_until(Schedule::recurs(3), |_| false)
        .run(&Env::new());

    assert_eq!(outcome, Err(Error::domain("attempt 3")));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[rstest]
fn retry_while_stops_on_non_matching_error() {
    let (calls, effect) = counted::<(), _>(|attempt| {
        if attempt == 1 {
            Err(Error::domain("fatal"))
        } else {
            Err(Error::domain("transient"))
        }
    });

    let outcome = effect
        .retry_while(Schedule::forever(), |error| error.message() == Some("transient"))
        .run(&Env::new());

    assert_eq!(outcome, Err(Error::domain("fatal")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn retry_waits_between_attempts() {
    let (calls, effect) = counted(|attempt| {
        if attempt < 3 {
            Err(Error::domain("busy"))
        } else {
            Ok(attempt)
        }
    });

    let started = tokio::time::Instant::now();
    let outcome = effect
        .retry(Schedule::exponential(Duration::from_millis(10)))
        .run_async(&Env::new())
        .await;

    assert_eq!(outcome, Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancellation_stops_retry_during_delay() {
    let (calls, effect) = counted::<(), _>(|_| Err(Error::domain("down")));
    let env = Env::new().with_timeout(Duration::from_millis(25));

    let outcome = effect
        .retry(Schedule::spaced(Duration::from_millis(10)))
        .run_async(&env)
        .await;

    assert_eq!(outcome, Err(Error::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Repeat and Fold
// =============================================================================

#[rstest]
fn repeat_returns_last_value() {
    let (calls, effect) = counted(Ok);
    assert_eq!(effect.repeat(Schedule::recurs(4)).run(&Env::new()), Ok(4));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[rstest]
fn repeat_until_stops_at_first_matching_value() {
    let (calls, effect) = counted(Ok);
    let outcome = effect
        .repeat_until(Schedule::forever(), |value| *value == 6)
        .run(&Env::new());
    assert_eq!(outcome, Ok(6));
    assert_eq!(calls.load(Ordering::SeqCst), 7);
}

#[rstest]
fn repeat_propagates_failure() {
    let (_, effect) = counted(|attempt| {
        if attempt == 2 {
            Err(Error::domain("halted"))
        } else {
            Ok(attempt)
        }
    });
    assert_eq!(
        effect.repeat(Schedule::recurs(10)).run(&Env::new()),
        Err(Error::domain("halted"))
    );
}

#[rstest]
fn fold_accumulates_every_iteration() {
    let (_, effect) = counted(Ok);
    let total = effect.fold(Schedule::recurs(4), 0, |sum, value| sum + value);
    assert_eq!(total.run(&Env::new()), Ok(10));
}

#[rstest]
fn fold_while_stops_once_state_fails_predicate() {
    let (calls, effect) = counted(Ok);
    let collected = effect.fold_while(
        Schedule::forever(),
        Vec::new(),
        |mut values, value| {
            values.push(value);
            values
        },
        |values| values.len() < 3,
    );
    assert_eq!(collected.run(&Env::new()), Ok(vec![0, 1, 2]));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[rstest]
fn repeated_memo_is_re_evaluated_each_iteration() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let memo = Effect::memo(move |_| Ok(counter.fetch_add(1, Ordering::SeqCst)));

    assert_eq!(memo.repeat(Schedule::recurs(2)).run(&Env::new()), Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[rstest]
fn retry_re_evaluates_a_mapped_memo() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let flaky = Effect::memo(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(Error::domain("not yet"))
        } else {
            Ok(7)
        }
    });

    let effect = flaky.map(|value| value + 1).retry(Schedule::recurs(3));
    assert_eq!(effect.run(&Env::new()), Ok(8));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[rstest]
fn retry_re_evaluates_a_memo_inside_a_scope_and_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let flaky = Effect::memo(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Error::domain("first attempt"))
        } else {
            Ok(String::from("connected"))
        }
    });

    let effect = flaky
        .catch(Error::is_timeout, |_| Effect::pure(String::from("fallback")))
        .bind(|label| Effect::pure(label.len()))
        .local_cancel()
        .retry(Schedule::recurs(1));
    assert_eq!(effect.run(&Env::new()), Ok(9));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

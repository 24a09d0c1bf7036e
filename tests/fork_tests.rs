use lambars_effect::prelude::*;
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// Fork
// =============================================================================

#[rstest]
fn fork_and_join_from_synchronous_code() {
    let effect = Effect::sleep(Duration::from_millis(5))
        .then(Effect::pure(String::from("background")))
        .fork(None)
        .bind(|handle| handle.join());
    assert_eq!(effect.run_default(), Ok(String::from("background")));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parent_cancellation_fires_child_trigger() {
    let env = Env::new();
    let handle = Effect::sleep(Duration::from_secs(60))
        .fork(None)
        .run_async(&env)
        .await
        .unwrap();

    let child = handle.token();
    assert!(!child.is_cancelled());

    env.cancel();
    assert!(child.is_cancelled());
    assert_eq!(handle.join().run_async(&Env::new()).await, Err(Error::Cancelled));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn child_cancellation_leaves_parent_running() {
    let env = Env::new();
    let handle = Effect::sleep(Duration::from_secs(60))
        .fork(None)
        .run_async(&env)
        .await
        .unwrap();

    handle.cancel().run_async(&env).await.unwrap();
    assert!(handle.token().is_cancelled());
    assert!(!env.is_cancelled());
    assert_eq!(Effect::pure(1).run_async(&env).await, Ok(1));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forks_run_concurrently() {
    let started = Arc::new(AtomicUsize::new(0));
    let worker = {
        let started = Arc::clone(&started);
        Effect::from_fn(move || Ok(started.fetch_add(1, Ordering::SeqCst)))
            .then(Effect::sleep(Duration::from_millis(20)))
    };

    let effect = worker
        .clone()
        .fork(None)
        .zip(worker.fork(None))
        .bind(|(left, right)| left.join().zip(right.join()));

    let clock = std::time::Instant::now();
    assert_eq!(effect.run_async(&Env::new()).await, Ok(((), ())));
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert!(clock.elapsed() < Duration::from_millis(500));
}

#[rstest]
#[tokio::test]
async fn forks_follow_runtime_affinity() {
    let pinned = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("pinned-worker")
        .enable_all()
        .build()
        .unwrap();

    let effect = Effect::from_fn(|| {
        Ok(std::thread::current()
            .name()
            .map(str::to_owned)
            .unwrap_or_default())
    })
    .fork(None)
    .bind(|handle| handle.join())
    .on_runtime(pinned.handle().clone());

    assert_eq!(
        effect.run_async(&Env::new()).await,
        Ok(String::from("pinned-worker"))
    );
    pinned.shutdown_background();
}

// =============================================================================
// Timeout
// =============================================================================

#[rstest]
#[tokio::test(start_paused = true)]
async fn slow_effect_times_out() {
    let effect = Effect::sleep(Duration::from_millis(200))
        .then(Effect::pure(1))
        .timeout(Duration::from_millis(100));

    let error = effect.run_async(&Env::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Timeout);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn fast_effect_beats_timeout() {
    let effect = Effect::sleep(Duration::from_millis(50))
        .then(Effect::pure(1))
        .timeout(Duration::from_millis(100));
    assert_eq!(effect.run_async(&Env::new()).await, Ok(1));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn timed_out_effect_still_runs_its_finalizer() {
    let observed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&observed);
    let body = Effect::sleep(Duration::from_millis(200)).finally(Effect::from_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let outcome = body
        .timeout(Duration::from_millis(10))
        .run_async(&Env::new())
        .await;

    assert!(outcome.is_err_and(|error| error.is_timeout()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[rstest]
fn timeout_with_retry_inside() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let effect = Effect::<()>::from_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(Error::domain("never works"))
    })
    .retry(Schedule::spaced(Duration::from_millis(5)))
    .timeout(Duration::from_millis(60));

    assert!(effect.run_default().is_err_and(|error| error.is_timeout()));
    assert!(calls.load(Ordering::SeqCst) >= 2);
}

//! Background execution and timeouts.
//!
//! [`Effect::fork`] starts an effect on the tokio runtime and hands back a
//! [`ForkHandle`]. The forked effect runs under a child environment whose
//! trigger is linked to the parent, so cancelling the parent cancels the
//! child. [`Effect::timeout`] races an effect against a delay in a linked
//! child environment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;

use super::Effect;
use super::interpreter;
use super::node::{Node, NodeRef, OutcomeFuture, erase, unbox};
use crate::env::{CancelSource, CancelToken, Env};
use crate::error::{Error, Result};
use crate::runtime;

/// A handle to an effect running in the background.
///
/// Handles are cheap to clone; every clone observes the same outcome.
pub struct ForkHandle<A> {
    source: CancelSource,
    outcome: watch::Receiver<Option<Result<A>>>,
}

impl<A> Clone for ForkHandle<A> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            outcome: self.outcome.clone(),
        }
    }
}

impl<A> fmt::Debug for ForkHandle<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ForkHandle")
            .field("cancelled", &self.source.is_cancelled())
            .field("finished", &self.outcome.borrow().is_some())
            .finish()
    }
}

impl<A: Clone + Send + Sync + 'static> ForkHandle<A> {
    /// Cancels the background effect. Idempotent.
    ///
    /// Cancellation is cooperative: the forked effect stops at its next step.
    #[must_use]
    pub fn cancel(&self) -> Effect<()> {
        let source = self.source.clone();
        Effect::lift(move |_| {
            if source.cancel() {
                tracing::trace!("forked effect cancelled");
            }
            Ok(())
        })
    }

    /// Waits for the background outcome.
    ///
    /// If the waiting environment is cancelled first, the wait is abandoned
    /// with [`Error::Cancelled`]; the background effect keeps running until
    /// it observes its own cancellation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    ///
    /// let effect = Effect::pure(21)
    ///     .map(|x| x * 2)
    ///     .fork(None)
    ///     .bind(|handle| handle.join());
    /// assert_eq!(effect.run_default(), Ok(42));
    /// ```
    #[must_use]
    pub fn join(&self) -> Effect<A> {
        let outcome = self.outcome.clone();
        Effect::lift_async(move |env: Env| {
            let outcome = outcome.clone();
            async move {
                tokio::select! {
                    biased;
                    settled = wait_outcome(outcome) => settled,
                    () = env.token().cancelled() => Err(Error::Cancelled),
                }
            }
        })
    }

    /// The cancellation token of the forked effect's environment.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        self.source.token()
    }

    /// Returns `true` once the background effect has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

async fn wait_outcome<A: Clone>(mut outcome: watch::Receiver<Option<Result<A>>>) -> Result<A> {
    let settled = outcome.borrow().clone();
    if let Some(settled) = settled {
        return settled;
    }
    match outcome.wait_for(Option::is_some).await {
        Ok(settled) => (*settled).clone().unwrap_or(Err(Error::Cancelled)),
        // The task was dropped before publishing, e.g. on runtime shutdown.
        Err(_) => Err(Error::Cancelled),
    }
}

fn spawn_fork<A>(node: &NodeRef, env: &Env, timeout: Option<Duration>) -> ForkHandle<A>
where
    A: Clone + Send + Sync + 'static,
{
    let (child, source) = env.derive_linked(timeout);
    let (sender, receiver) = watch::channel(None);
    let node = Arc::clone(node);

    tracing::debug!(?timeout, "forking effect");
    runtime::spawn(env.affinity(), async move {
        let outcome = interpreter::run_async(node, child.clone())
            .await
            .map(unbox::<A>);
        child.dispose();
        tracing::debug!(succeeded = outcome.is_ok(), "forked effect finished");
        sender.send_replace(Some(outcome));
    });

    ForkHandle {
        source,
        outcome: receiver,
    }
}

/// Runs `node` in a linked child of `env`, failing with [`Error::Timeout`]
/// once `duration` elapses.
///
/// On timeout the child is cancelled and the run abandoned: it is moved to a
/// background task so its finalizers still run once it observes the
/// cancellation. Cancelling `env` abandons the run the same way.
pub(crate) fn race_timeout(node: NodeRef, env: Env, duration: Duration) -> OutcomeFuture {
    async move {
        let (child, source) = env.derive_linked(None);
        let mut run = interpreter::run_async(node, child.clone()).boxed();
        let outcome = tokio::select! {
            biased;
            () = tokio::time::sleep(duration) => {
                source.cancel();
                tracing::debug!(?duration, "timeout elapsed");
                Err(Error::timeout(duration))
            }
            () = env.token().cancelled() => Err(Error::Cancelled),
            outcome = &mut run => {
                child.dispose();
                return outcome;
            }
        };
        runtime::spawn(env.affinity(), async move {
            let _ = run.await;
            child.dispose();
        });
        outcome
    }
    .boxed()
}

impl<A: Send + 'static> Effect<A> {
    /// Starts the effect in the background and yields a handle to it.
    ///
    /// The forked effect runs under a child environment linked to the current
    /// one. With `timeout`, the child is also cancelled once it elapses.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Optional budget after which the forked effect is cancelled.
    #[must_use]
    pub fn fork(self, timeout: Option<Duration>) -> Effect<ForkHandle<A>>
    where
        A: Clone + Sync,
    {
        let node = self.into_node();
        Effect::from_node(Node::Fork(Arc::new(move |env: &Env| {
            erase(spawn_fork::<A>(&node, env, timeout))
        })))
    }

    /// Fails with [`Error::Timeout`] unless the effect finishes within
    /// `duration`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_effect::effect::Effect;
    /// use std::time::Duration;
    ///
    /// let slow = Effect::sleep(Duration::from_secs(5)).timeout(Duration::from_millis(10));
    /// assert!(slow.run_default().is_err_and(|error| error.is_timeout()));
    /// ```
    #[must_use]
    pub fn timeout(self, duration: Duration) -> Self {
        Self::from_node(Node::Timeout {
            source: self.into_node(),
            duration,
        })
    }
}

//! The trampolined run loop.
//!
//! Effects are evaluated by a single loop over an explicit stack of
//! continuation frames, so neither deep `bind` chains nor long error
//! unwinds grow the call stack. Asynchronous steps surface as
//! [`Control::Suspend`]; the two drivers differ only in how they wait for
//! them: [`run_sync`] blocks via the runtime bridge, [`run_async`] awaits.
//!
//! Cancellation is checked before every node is invoked, except inspections,
//! scope entries and finalizer installation. A rerun forces fresh
//! evaluation of the memoized leaves reached through forwarding nodes.
//! Panics raised by user functions are caught at the step that ran them and
//! become [`Error::Panicked`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use smallvec::SmallVec;

use super::fork;
use super::node::{
    BindAsyncFn, BindFn, CombineFn, HandlerFn, LocalScope, MapFn, MemoNode, Node, NodeRef,
    Outcome, OutcomeFuture, PredicateFn, RegisterFn, Value, erase,
};
use super::retry::{ScheduleSession, Step};
use crate::env::{CancelToken, Env, Ledger};
use crate::error::Error;
use crate::runtime;
use crate::schedule::ScheduleIter;

/// What the loop does next.
pub(crate) enum Control {
    Eval(NodeRef),
    /// Evaluate again, forcing fresh evaluation of memoized leaves.
    Rerun(NodeRef),
    Return(Outcome),
    Suspend(OutcomeFuture),
    Done(Outcome),
}

/// What happens to the environment when a scoped body finishes.
enum ScopeExit {
    Keep,
    Dispose(Env),
    Release(Ledger),
}

/// One running schedule session.
struct ScheduleRun {
    source: NodeRef,
    delays: ScheduleIter,
    session: Box<dyn ScheduleSession>,
    iteration: u32,
}

enum Frame {
    Map(MapFn),
    Bind(BindFn),
    BindAsync(BindAsyncFn),
    ApplyRight {
        right: NodeRef,
        combine: CombineFn,
    },
    ApplyCombine {
        left: Value,
        combine: CombineFn,
    },
    Catch {
        predicate: PredicateFn,
        handler: HandlerFn,
    },
    Finally(NodeRef),
    /// Replaces the finalizer's outcome with the body's. A finalizer failure
    /// wins over a body success when `surface_failure` is set.
    Resume {
        outcome: Outcome,
        surface_failure: bool,
    },
    Restore {
        env: Env,
        exit: ScopeExit,
    },
    Register(RegisterFn),
    Schedule(Box<ScheduleRun>),
    Rerun(NodeRef),
}

/// Runs `body`, turning a panic into [`Error::Panicked`].
fn guarded<T>(body: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let error = Error::panicked(payload.as_ref());
        tracing::warn!(%error, "effect step panicked");
        Err(error)
    })
}

fn guarded_future(future: OutcomeFuture) -> OutcomeFuture {
    AssertUnwindSafe(future)
        .catch_unwind()
        .map(|result| {
            result.unwrap_or_else(|payload| {
                let error = Error::panicked(payload.as_ref());
                tracing::warn!(%error, "asynchronous effect step panicked");
                Err(error)
            })
        })
        .boxed()
}

/// Sleeps for `duration` unless `token` is cancelled first.
pub(crate) fn sleep(duration: Duration, token: CancelToken) -> OutcomeFuture {
    async move {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(duration) => Ok(erase(())),
        }
    }
    .boxed()
}

/// Continues into `source`, keeping a rerun's freshness.
fn descend(source: &NodeRef, fresh: bool) -> Control {
    let source = Arc::clone(source);
    if fresh {
        Control::Rerun(source)
    } else {
        Control::Eval(source)
    }
}

pub(crate) struct RunLoop {
    env: Env,
    frames: SmallVec<[Frame; 8]>,
}

impl RunLoop {
    fn new(env: Env) -> Self {
        Self {
            env,
            frames: SmallVec::new(),
        }
    }

    fn advance(&mut self, control: Control) -> Control {
        match control {
            Control::Eval(node) => self.invoke(&node, false),
            Control::Rerun(node) => self.invoke(&node, true),
            Control::Return(outcome) => match self.frames.pop() {
                Some(frame) => self.resume(frame, outcome),
                None => Control::Done(outcome),
            },
            other => other,
        }
    }

    fn invoke(&mut self, node: &NodeRef, fresh: bool) -> Control {
        if let Node::Inspect(read) = &**node {
            return Control::Return(guarded(|| read(&self.env)));
        }
        // Scopes and finalizers are installed regardless; the body is checked next.
        if !matches!(&**node, Node::Local { .. } | Node::Finally { .. })
            && self.env.is_cancelled()
        {
            tracing::trace!(node = node.name(), "cancellation observed");
            return Control::Return(Err(Error::Cancelled));
        }

        match &**node {
            Node::Pure(make) => Control::Return(guarded(|| Ok(make()))),
            Node::Fail(error) => Control::Return(Err(error.clone())),
            Node::Never => Control::Return(Err(Error::Bottom)),
            Node::Sync(function) | Node::Inspect(function) => {
                Control::Return(guarded(|| function(&self.env)))
            }
            Node::Async(function) => match guarded(|| Ok(function(self.env.clone()))) {
                Ok(future) => Control::Suspend(guarded_future(future)),
                Err(error) => Control::Return(Err(error)),
            },
            Node::Memo(MemoNode::Sync(thunk)) => {
                Control::Return(thunk.evaluate(&self.env, fresh))
            }
            Node::Memo(MemoNode::Async(thunk)) => {
                Control::Suspend(thunk.evaluate(&self.env, fresh))
            }
            Node::Map { source, map, .. } => {
                self.frames.push(Frame::Map(Arc::clone(map)));
                descend(source, fresh)
            }
            Node::Bind { source, next } => {
                self.frames.push(Frame::Bind(Arc::clone(next)));
                descend(source, fresh)
            }
            Node::BindAsync { source, next } => {
                self.frames.push(Frame::BindAsync(Arc::clone(next)));
                descend(source, fresh)
            }
            Node::Apply {
                left,
                right,
                combine,
            } => {
                self.frames.push(Frame::ApplyRight {
                    right: Arc::clone(right),
                    combine: Arc::clone(combine),
                });
                descend(left, fresh)
            }
            Node::Catch {
                source,
                predicate,
                handler,
            } => {
                self.frames.push(Frame::Catch {
                    predicate: Arc::clone(predicate),
                    handler: Arc::clone(handler),
                });
                descend(source, fresh)
            }
            Node::Finally { source, finalizer } => {
                self.frames.push(Frame::Finally(Arc::clone(finalizer)));
                descend(source, fresh)
            }
            Node::Local { source, scope } => self.enter(scope, source, fresh),
            Node::Acquire { source, register } => {
                self.frames.push(Frame::Register(Arc::clone(register)));
                descend(source, fresh)
            }
            Node::Release(key) => Control::Eval(self.env.ledger().release(*key).into_node()),
            Node::Sleep(duration) => {
                Control::Suspend(sleep(*duration, self.env.token().clone()))
            }
            Node::Fork(spawn) => Control::Return(guarded(|| Ok(spawn(&self.env)))),
            Node::Timeout { source, duration } => Control::Suspend(fork::race_timeout(
                Arc::clone(source),
                self.env.clone(),
                *duration,
            )),
            Node::Schedule {
                source,
                schedule,
                policy,
            } => {
                self.frames.push(Frame::Schedule(Box::new(ScheduleRun {
                    source: Arc::clone(source),
                    delays: schedule.iter(),
                    session: policy.start(),
                    iteration: 1,
                })));
                descend(source, fresh)
            }
        }
    }

    fn enter(&mut self, scope: &LocalScope, source: &NodeRef, fresh: bool) -> Control {
        let saved = self.env.clone();
        let (derived, exit) = match scope {
            LocalScope::Map(localize) => match guarded(|| Ok(localize(&saved))) {
                Ok(derived) => (derived, ScopeExit::Keep),
                Err(error) => return Control::Return(Err(error)),
            },
            LocalScope::Cancel => {
                let derived = saved.with_local_cancel();
                (derived.clone(), ScopeExit::Dispose(derived))
            }
            LocalScope::Resources => {
                let derived = saved.with_child_ledger();
                let ledger = derived.ledger().clone();
                (derived, ScopeExit::Release(ledger))
            }
            LocalScope::Uninterruptible => (saved.uninterruptible(), ScopeExit::Keep),
        };
        self.frames.push(Frame::Restore { env: saved, exit });
        self.env = derived;
        descend(source, fresh)
    }

    /// Runs `node` under the uninterruptible form of the current
    /// environment, then hands `outcome` on.
    fn shielded(&mut self, node: NodeRef, outcome: Outcome, surface_failure: bool) -> Control {
        self.frames.push(Frame::Resume {
            outcome,
            surface_failure,
        });
        self.frames.push(Frame::Restore {
            env: self.env.clone(),
            exit: ScopeExit::Keep,
        });
        self.env = self.env.uninterruptible();
        Control::Eval(node)
    }

    fn resume(&mut self, frame: Frame, outcome: Outcome) -> Control {
        match frame {
            Frame::Map(map) => Control::Return(outcome.and_then(|value| guarded(|| Ok(map(value))))),
            Frame::Bind(next) => match outcome.and_then(|value| guarded(|| Ok(next(value)))) {
                Ok(node) => Control::Eval(node),
                Err(error) => Control::Return(Err(error)),
            },
            Frame::BindAsync(next) => match outcome.and_then(|value| guarded(|| Ok(next(value))))
            {
                Ok(future) => Control::Suspend(guarded_future(future)),
                Err(error) => Control::Return(Err(error)),
            },
            Frame::ApplyRight { right, combine } => match outcome {
                Ok(left) => {
                    self.frames.push(Frame::ApplyCombine { left, combine });
                    Control::Eval(right)
                }
                Err(error) => Control::Return(Err(error)),
            },
            Frame::ApplyCombine { left, combine } => {
                Control::Return(outcome.and_then(|right| guarded(|| Ok(combine(left, right)))))
            }
            Frame::Catch { predicate, handler } => match outcome {
                Err(error) => match guarded(|| Ok(predicate(&error))) {
                    Ok(true) => {
                        tracing::trace!(kind = ?error.kind(), "failure caught");
                        match guarded(|| Ok(handler(error))) {
                            Ok(node) => Control::Eval(node),
                            Err(error) => Control::Return(Err(error)),
                        }
                    }
                    Ok(false) => Control::Return(Err(error)),
                    // A panicking predicate replaces the failure it inspected.
                    Err(panic) => Control::Return(Err(panic)),
                },
                outcome => Control::Return(outcome),
            },
            Frame::Finally(finalizer) => self.shielded(finalizer, outcome, true),
            Frame::Resume {
                outcome: saved,
                surface_failure,
            } => match (saved, outcome) {
                (Ok(_), Err(error)) if surface_failure => Control::Return(Err(error)),
                (saved, _) => Control::Return(saved),
            },
            Frame::Restore { env, exit } => {
                self.env = env;
                match exit {
                    ScopeExit::Keep => Control::Return(outcome),
                    ScopeExit::Dispose(derived) => {
                        derived.dispose();
                        Control::Return(outcome)
                    }
                    ScopeExit::Release(ledger) => {
                        tracing::debug!(ledger = ledger.id(), "resource scope exited");
                        self.shielded(ledger.release_all().into_node(), outcome, false)
                    }
                }
            }
            Frame::Register(register) => match outcome {
                Ok(value) => match guarded(|| Ok(register(&value, self.env.ledger()))) {
                    Ok(_) => Control::Return(Ok(value)),
                    Err(error) => Control::Return(Err(error)),
                },
                Err(error) => Control::Return(Err(error)),
            },
            Frame::Schedule(run) => self.step_schedule(run, outcome),
            Frame::Rerun(node) => match outcome {
                Ok(_) => Control::Rerun(node),
                Err(error) => Control::Return(Err(error)),
            },
        }
    }

    fn step_schedule(&mut self, mut run: Box<ScheduleRun>, outcome: Outcome) -> Control {
        if matches!(outcome, Err(Error::Cancelled)) {
            return Control::Return(outcome);
        }
        let step = match guarded(|| Ok(run.session.feed(outcome))) {
            Ok(step) => step,
            Err(error) => return Control::Return(Err(error)),
        };
        match step {
            Step::Stop(outcome) => Control::Return(outcome),
            Step::Continue => match run.delays.next() {
                None => Control::Return(run.session.exhausted()),
                Some(delay) => {
                    run.iteration = run.iteration.saturating_add(1);
                    tracing::debug!(iteration = run.iteration, ?delay, "schedule iteration");
                    let source = Arc::clone(&run.source);
                    self.frames.push(Frame::Schedule(run));
                    if delay.is_zero() {
                        Control::Rerun(source)
                    } else {
                        self.frames.push(Frame::Rerun(source));
                        Control::Suspend(sleep(delay, self.env.token().clone()))
                    }
                }
            },
        }
    }
}

/// Runs `node` to completion on the calling thread.
pub(crate) fn run_sync(node: NodeRef, env: Env) -> Outcome {
    let mut run = RunLoop::new(env);
    let mut control = Control::Eval(node);
    loop {
        control = match control {
            Control::Done(outcome) => return outcome,
            Control::Suspend(future) => Control::Return(
                runtime::try_run_blocking(future).unwrap_or_else(|error| Err(error.into())),
            ),
            other => run.advance(other),
        };
    }
}

/// Runs `node` to completion, awaiting asynchronous steps.
pub(crate) async fn run_async(node: NodeRef, env: Env) -> Outcome {
    let mut run = RunLoop::new(env);
    let mut control = Control::Eval(node);
    loop {
        control = match control {
            Control::Done(outcome) => return outcome,
            Control::Suspend(future) => Control::Return(future.await),
            other => run.advance(other),
        };
    }
}

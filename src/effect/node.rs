//! The closed, type-erased node set effects are built from.
//!
//! Every [`Effect`](super::Effect) is a handle to an immutable tree of
//! [`Node`]s. Values travel between nodes as boxed `Any`; the typed surface in
//! the parent module is the only place that boxes and unboxes them.

use std::any::Any;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use smallvec::SmallVec;

use super::retry::SchedulePolicy;
use crate::control::{AsyncThunk, Thunk};
use crate::env::{Env, Ledger, ResourceKey};
use crate::error::Error;
use crate::schedule::Schedule;

pub(crate) type Value = Box<dyn Any + Send>;
pub(crate) type Outcome = Result<Value, Error>;
pub(crate) type NodeRef = Arc<Node>;
pub(crate) type OutcomeFuture = BoxFuture<'static, Outcome>;

pub(crate) type PureFn = Arc<dyn Fn() -> Value + Send + Sync>;
pub(crate) type SyncFn = Arc<dyn Fn(&Env) -> Outcome + Send + Sync>;
pub(crate) type AsyncFn = Arc<dyn Fn(Env) -> OutcomeFuture + Send + Sync>;
pub(crate) type MapFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub(crate) type BindFn = Arc<dyn Fn(Value) -> NodeRef + Send + Sync>;
pub(crate) type BindAsyncFn = Arc<dyn Fn(Value) -> OutcomeFuture + Send + Sync>;
pub(crate) type CombineFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;
pub(crate) type PredicateFn = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
pub(crate) type HandlerFn = Arc<dyn Fn(Error) -> NodeRef + Send + Sync>;
pub(crate) type EnvFn = Arc<dyn Fn(&Env) -> Env + Send + Sync>;
/// Registers the acquired value in a ledger; returns `false` if the value is
/// not the expected resource type.
pub(crate) type RegisterFn = Arc<dyn Fn(&Value, &Ledger) -> bool + Send + Sync>;
pub(crate) type ForkFn = Arc<dyn Fn(&Env) -> Value + Send + Sync>;

#[inline]
pub(crate) fn erase<A: Send + 'static>(value: A) -> Value {
    Box::new(value)
}

/// Recovers a typed value. The typed surface guarantees the type matches.
#[inline]
pub(crate) fn unbox<A: 'static>(value: Value) -> A {
    match value.downcast::<A>() {
        Ok(value) => *value,
        Err(_) => unreachable!(
            "effect value is not a {}",
            std::any::type_name::<A>()
        ),
    }
}

/// How a [`Node::Local`] derives the environment of its body.
pub(crate) enum LocalScope {
    Map(EnvFn),
    Cancel,
    Resources,
    Uninterruptible,
}

pub(crate) trait ErasedThunk: Send + Sync {
    fn evaluate(&self, env: &Env, fresh: bool) -> Outcome;
    fn reset(&self) -> Arc<dyn ErasedThunk>;
}

impl<A: Clone + Send + Sync + 'static> ErasedThunk for Thunk<A> {
    fn evaluate(&self, env: &Env, fresh: bool) -> Outcome {
        let outcome = if fresh {
            self.re_value(env)
        } else {
            self.value(env)
        };
        outcome.map(erase)
    }

    fn reset(&self) -> Arc<dyn ErasedThunk> {
        Arc::new(self.clone())
    }
}

pub(crate) trait ErasedAsyncThunk: Send + Sync {
    fn evaluate(&self, env: &Env, fresh: bool) -> OutcomeFuture;
    fn reset(&self) -> Arc<dyn ErasedAsyncThunk>;
}

impl<A: Clone + Send + Sync + 'static> ErasedAsyncThunk for AsyncThunk<A> {
    fn evaluate(&self, env: &Env, fresh: bool) -> OutcomeFuture {
        if fresh {
            self.re_value(env).map(|outcome| outcome.map(erase)).boxed()
        } else {
            self.value(env).map(|outcome| outcome.map(erase)).boxed()
        }
    }

    fn reset(&self) -> Arc<dyn ErasedAsyncThunk> {
        Arc::new(self.clone())
    }
}

pub(crate) enum MemoNode {
    Sync(Arc<dyn ErasedThunk>),
    Async(Arc<dyn ErasedAsyncThunk>),
}

pub(crate) enum Node {
    Pure(PureFn),
    Fail(Error),
    Never,
    Sync(SyncFn),
    /// Reads the environment without observing cancellation.
    Inspect(SyncFn),
    Async(AsyncFn),
    Memo(MemoNode),
    Map {
        source: NodeRef,
        map: MapFn,
        /// How many maps were fused into `map`.
        fused: u8,
    },
    Bind {
        source: NodeRef,
        next: BindFn,
    },
    BindAsync {
        source: NodeRef,
        next: BindAsyncFn,
    },
    Apply {
        left: NodeRef,
        right: NodeRef,
        combine: CombineFn,
    },
    Catch {
        source: NodeRef,
        predicate: PredicateFn,
        handler: HandlerFn,
    },
    Finally {
        source: NodeRef,
        finalizer: NodeRef,
    },
    Local {
        source: NodeRef,
        scope: LocalScope,
    },
    Acquire {
        source: NodeRef,
        register: RegisterFn,
    },
    Release(ResourceKey),
    Sleep(Duration),
    Fork(ForkFn),
    Timeout {
        source: NodeRef,
        duration: Duration,
    },
    Schedule {
        source: NodeRef,
        schedule: Schedule,
        policy: Arc<dyn SchedulePolicy>,
    },
}

static DETACHED: LazyLock<NodeRef> = LazyLock::new(|| Arc::new(Node::Never));

impl Node {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Pure(_) => "Pure",
            Self::Fail(_) => "Fail",
            Self::Never => "Never",
            Self::Sync(_) => "Sync",
            Self::Inspect(_) => "Inspect",
            Self::Async(_) => "Async",
            Self::Memo(_) => "Memo",
            Self::Map { .. } => "Map",
            Self::Bind { .. } => "Bind",
            Self::BindAsync { .. } => "BindAsync",
            Self::Apply { .. } => "Apply",
            Self::Catch { .. } => "Catch",
            Self::Finally { .. } => "Finally",
            Self::Local { .. } => "Local",
            Self::Acquire { .. } => "Acquire",
            Self::Release(_) => "Release",
            Self::Sleep(_) => "Sleep",
            Self::Fork(_) => "Fork",
            Self::Timeout { .. } => "Timeout",
            Self::Schedule { .. } => "Schedule",
        }
    }

    /// Moves uniquely owned children out so they can be dropped iteratively.
    fn detach_children(&mut self, detached: &mut SmallVec<[NodeRef; 8]>) {
        let slots: [Option<&mut NodeRef>; 2] = match self {
            Self::Map { source, .. }
            | Self::Bind { source, .. }
            | Self::BindAsync { source, .. }
            | Self::Catch { source, .. }
            | Self::Local { source, .. }
            | Self::Acquire { source, .. }
            | Self::Timeout { source, .. }
            | Self::Schedule { source, .. } => [Some(source), None],
            Self::Apply { left, right, .. } => [Some(left), Some(right)],
            Self::Finally { source, finalizer } => [Some(source), Some(finalizer)],
            _ => [None, None],
        };
        for slot in slots.into_iter().flatten() {
            if Arc::strong_count(slot) == 1 {
                detached.push(std::mem::replace(slot, Arc::clone(&DETACHED)));
            }
        }
    }
}

// Long left-nested chains would otherwise be torn down recursively.
impl Drop for Node {
    fn drop(&mut self) {
        let mut detached = SmallVec::new();
        self.detach_children(&mut detached);
        while let Some(child) = detached.pop() {
            if let Some(mut node) = Arc::into_inner(child) {
                node.detach_children(&mut detached);
            }
        }
    }
}

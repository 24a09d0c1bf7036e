//! The atomic lifecycle shared by [`Thunk`](super::Thunk) and
//! [`AsyncThunk`](super::AsyncThunk).

use std::sync::atomic::{AtomicU8, Ordering};

use crate::config;

/// Lifecycle of a memoized computation.
///
/// `NotEvaluated` and `Evaluating` are transient; the three terminal states
/// hold a cached outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThunkState {
    /// The function has not started.
    NotEvaluated = 0,
    /// Exactly one caller is running the function.
    Evaluating = 1,
    /// A value is cached.
    Success = 2,
    /// A failure is cached.
    Failed = 3,
    /// The evaluation observed cancellation.
    Cancelled = 4,
}

impl ThunkState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotEvaluated,
            1 => Self::Evaluating,
            2 => Self::Success,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Returns `true` for `Success`, `Failed` and `Cancelled`.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// An atomically updated [`ThunkState`].
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new(state: ThunkState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub(crate) fn load(&self) -> ThunkState {
        ThunkState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Claims the evaluation slot if the state is still `from`.
    #[inline]
    pub(crate) fn begin(&self, from: ThunkState) -> bool {
        self.0
            .compare_exchange(
                from as u8,
                ThunkState::Evaluating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publishes a terminal state. Only the caller that won [`begin`](Self::begin)
    /// may publish.
    #[inline]
    pub(crate) fn publish(&self, state: ThunkState) {
        debug_assert!(state.is_terminal());
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Exponential spin backoff for callers waiting on another evaluator.
///
/// Spins `2^round` times per call (capped at the configured shift) and starts
/// yielding the thread once the configured number of rounds has passed.
/// There is no upper bound: a slow evaluator is waited for, not reported.
pub(crate) struct Backoff {
    round: u32,
    yield_after: u32,
    max_shift: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        let settings = config::current();
        Self {
            round: 0,
            yield_after: settings.spin_yield_threshold(),
            max_shift: settings.max_backoff_shift(),
        }
    }

    pub(crate) fn snooze(&mut self) {
        for _ in 0..(1_u32 << self.round.min(self.max_shift)) {
            std::hint::spin_loop();
        }
        self.round = self.round.saturating_add(1);
        if self.round > self.yield_after {
            std::thread::yield_now();
        }
    }
}

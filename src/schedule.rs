//! Composable delay schedules for retrying, repeating and folding effects.
//!
//! A [`Schedule`] is pure data describing a sequence of delays. Each call to
//! [`Schedule::iter`] produces a fresh [`ScheduleIter`], so one schedule can
//! drive any number of independent sessions. The length of the sequence is the
//! number of *additional* iterations a session may run after the first one,
//! and each element is the pause taken before that iteration.
//!
//! Delays are derived from previous delays only, never from the wall clock.
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::schedule::Schedule;
//! use std::time::Duration;
//!
//! let schedule = Schedule::exponential(Duration::from_millis(10))
//!     .max_delay(Duration::from_millis(50))
//!     .take(4);
//!
//! let delays: Vec<_> = schedule.iter().collect();
//! assert_eq!(
//!     delays,
//!     vec![
//!         Duration::from_millis(10),
//!         Duration::from_millis(20),
//!         Duration::from_millis(40),
//!         Duration::from_millis(50),
//!     ]
//! );
//! ```

use std::fmt;
use std::iter;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Forever,
    Never,
    Recurs(usize),
    Spaced(Duration),
    Exponential { base: Duration, factor: f64 },
    Linear(Duration),
    Fibonacci(Duration),
    Durations(Arc<[Duration]>),
    Take(Schedule, usize),
    MaxDelay(Schedule, Duration),
    MaxCumulativeDelay(Schedule, Duration),
    Union(Schedule, Schedule),
    Intersect(Schedule, Schedule),
    Append(Schedule, Schedule),
    Jitter(Schedule, f64),
}

/// A reusable description of delays between iterations.
#[derive(Clone, PartialEq)]
pub struct Schedule {
    kind: Arc<Kind>,
}

impl Schedule {
    fn from_kind(kind: Kind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Unlimited iterations, no delay.
    #[must_use]
    pub fn forever() -> Self {
        Self::from_kind(Kind::Forever)
    }

    /// No additional iterations.
    #[must_use]
    pub fn never() -> Self {
        Self::from_kind(Kind::Never)
    }

    /// Exactly one additional iteration, no delay.
    #[must_use]
    pub fn once() -> Self {
        Self::recurs(1)
    }

    /// `times` additional iterations, no delay.
    #[must_use]
    pub fn recurs(times: usize) -> Self {
        Self::from_kind(Kind::Recurs(times))
    }

    /// Unlimited iterations, `delay` apart.
    #[must_use]
    pub fn spaced(delay: Duration) -> Self {
        Self::from_kind(Kind::Spaced(delay))
    }

    /// Unlimited iterations with delays `base, 2*base, 4*base, ...`.
    #[must_use]
    pub fn exponential(base: Duration) -> Self {
        Self::exponential_by(base, 2.0)
    }

    /// Unlimited iterations with delays growing by `factor` each time.
    ///
    /// A negative or NaN `factor` yields `base` once, then zero delays.
    #[must_use]
    pub fn exponential_by(base: Duration, factor: f64) -> Self {
        Self::from_kind(Kind::Exponential { base, factor })
    }

    /// Unlimited iterations with delays `base, 2*base, 3*base, ...`.
    #[must_use]
    pub fn linear(base: Duration) -> Self {
        Self::from_kind(Kind::Linear(base))
    }

    /// Unlimited iterations; each delay is the sum of the previous two,
    /// starting from `base, base`.
    #[must_use]
    pub fn fibonacci(base: Duration) -> Self {
        Self::from_kind(Kind::Fibonacci(base))
    }

    /// Exactly the given delays.
    #[must_use]
    pub fn from_durations(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self::from_kind(Kind::Durations(delays.into_iter().collect()))
    }

    // =========================================================================
    // Combinators
    // =========================================================================

    /// At most `count` iterations of `self`.
    #[must_use]
    pub fn take(self, count: usize) -> Self {
        Self::from_kind(Kind::Take(self, count))
    }

    /// Caps every delay at `limit`.
    #[must_use]
    pub fn max_delay(self, limit: Duration) -> Self {
        Self::from_kind(Kind::MaxDelay(self, limit))
    }

    /// Stops before the running total of delays would exceed `limit`.
    #[must_use]
    pub fn max_cumulative_delay(self, limit: Duration) -> Self {
        Self::from_kind(Kind::MaxCumulativeDelay(self, limit))
    }

    /// Continues while *either* schedule continues, taking the shorter delay.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self::from_kind(Kind::Union(self, other))
    }

    /// Continues while *both* schedules continue, taking the longer delay.
    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        Self::from_kind(Kind::Intersect(self, other))
    }

    /// Runs `self` to exhaustion, then `other`.
    #[must_use]
    pub fn append(self, other: Self) -> Self {
        Self::from_kind(Kind::Append(self, other))
    }

    /// Randomizes every delay by up to `±factor` of its value.
    ///
    /// `factor` is clamped to `0.0..=1.0`. Requires the `jitter` feature;
    /// without it delays are left untouched.
    #[must_use]
    pub fn jitter(self, factor: f64) -> Self {
        Self::from_kind(Kind::Jitter(self, factor.clamp(0.0, 1.0)))
    }

    /// Starts a new session over this schedule's delays.
    #[must_use]
    pub fn iter(&self) -> ScheduleIter {
        ScheduleIter {
            inner: self.delays(),
        }
    }

    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match &*self.kind {
            Kind::Forever => Box::new(iter::repeat(Duration::ZERO)),
            Kind::Never => Box::new(iter::empty()),
            Kind::Recurs(times) => Box::new(iter::repeat_n(Duration::ZERO, *times)),
            Kind::Spaced(delay) => Box::new(iter::repeat(*delay)),
            Kind::Exponential { base, factor } => {
                let factor = *factor;
                Box::new(iter::successors(Some(*base), move |previous| {
                    Some(scale(*previous, factor))
                }))
            }
            Kind::Linear(base) => {
                let base = *base;
                Box::new((1_u32..).map(move |step| base.saturating_mul(step)))
            }
            Kind::Fibonacci(base) => {
                let base = *base;
                Box::new(
                    iter::successors(Some((base, base)), |(previous, current)| {
                        Some((*current, previous.saturating_add(*current)))
                    })
                    .map(|(delay, _)| delay),
                )
            }
            Kind::Durations(delays) => {
                let delays = Arc::clone(delays);
                Box::new((0..delays.len()).map(move |index| delays[index]))
            }
            Kind::Take(schedule, count) => Box::new(schedule.delays().take(*count)),
            Kind::MaxDelay(schedule, limit) => {
                let limit = *limit;
                Box::new(schedule.delays().map(move |delay| delay.min(limit)))
            }
            Kind::MaxCumulativeDelay(schedule, limit) => {
                let limit = *limit;
                Box::new(
                    schedule
                        .delays()
                        .scan(Duration::ZERO, move |total, delay| {
                            *total = total.saturating_add(delay);
                            (*total <= limit).then_some(delay)
                        }),
                )
            }
            Kind::Union(left, right) => Box::new(ZipLongest {
                left: left.delays(),
                right: right.delays(),
            }),
            Kind::Intersect(left, right) => Box::new(
                left.delays()
                    .zip(right.delays())
                    .map(|(left, right)| left.max(right)),
            ),
            Kind::Append(first, second) => Box::new(first.delays().chain(second.delays())),
            Kind::Jitter(schedule, factor) => {
                let factor = *factor;
                Box::new(schedule.delays().map(move |delay| jittered(delay, factor)))
            }
        }
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.kind, formatter)
    }
}

/// Negative and NaN products clamp to zero; overflow saturates.
fn scale(delay: Duration, factor: f64) -> Duration {
    let seconds = delay.as_secs_f64() * factor;
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

#[cfg(feature = "jitter")]
fn jittered(delay: Duration, factor: f64) -> Duration {
    use rand::Rng;

    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let offset = rand::rng().random_range(-factor..=factor);
    scale(delay, 1.0 + offset)
}

#[cfg(not(feature = "jitter"))]
const fn jittered(delay: Duration, _factor: f64) -> Duration {
    delay
}

/// Yields while either side yields; the shorter delay wins where both do.
struct ZipLongest {
    left: Box<dyn Iterator<Item = Duration> + Send>,
    right: Box<dyn Iterator<Item = Duration> + Send>,
}

impl Iterator for ZipLongest {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match (self.left.next(), self.right.next()) {
            (Some(left), Some(right)) => Some(left.min(right)),
            (Some(delay), None) | (None, Some(delay)) => Some(delay),
            (None, None) => None,
        }
    }
}

/// One session's view of a [`Schedule`]: the remaining delays.
pub struct ScheduleIter {
    inner: Box<dyn Iterator<Item = Duration> + Send>,
}

impl Iterator for ScheduleIter {
    type Item = Duration;

    #[inline]
    fn next(&mut self) -> Option<Duration> {
        self.inner.next()
    }
}

impl fmt::Debug for ScheduleIter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("ScheduleIter").finish_non_exhaustive()
    }
}

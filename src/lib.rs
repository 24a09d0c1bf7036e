//! # lambars-effect
//!
//! A trampolined effect runtime for Rust.
//!
//! ## Overview
//!
//! An [`Effect<A>`](effect::Effect) is an immutable, cheaply clonable
//! description of a computation that yields an `A` or fails with an
//! [`Error`]. Effects are composed with `map`, `bind`, `catch`, `finally` and
//! friends, then run by an interpreter that keeps deep chains off the call
//! stack. The crate provides:
//!
//! - **Effects**: synchronous and asynchronous lifts, memoized lifts,
//!   predicate-gated error handling, finalizers
//! - **Thunks**: thread-safe at-most-once evaluation ([`control::Thunk`],
//!   [`control::AsyncThunk`])
//! - **Environments**: cooperative cancellation, nested resource ledgers and
//!   runtime affinity ([`env::Env`])
//! - **Schedules**: pure delay sequences driving `retry`, `repeat` and `fold`
//!   ([`schedule::Schedule`])
//! - **Concurrency**: `fork` with cancellable handles, `timeout` races
//!
//! ## Feature Flags
//!
//! - `serde`: `Serialize`/`Deserialize` for [`config::RuntimeConfig`]
//! - `jitter`: randomized schedule delays
//! - `full`: Enable all features
//!
//! ## Example
//!
//! ```rust
//! use lambars_effect::prelude::*;
//! use std::time::Duration;
//!
//! let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
//! let counter = attempts.clone();
//!
//! let flaky = Effect::from_fn(move || {
//!     let attempt = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
//!     if attempt < 2 {
//!         Err(Error::domain("not yet"))
//!     } else {
//!         Ok(attempt)
//!     }
//! });
//!
//! let effect = flaky
//!     .retry(Schedule::spaced(Duration::from_millis(1)).take(5))
//!     .timeout(Duration::from_secs(1));
//!
//! assert_eq!(effect.run_default(), Ok(2));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_closure_for_method_calls)]

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```rust
/// use lambars_effect::prelude::*;
/// ```
pub mod prelude {
    pub use crate::control::{AsyncThunk, Thunk, ThunkState};
    pub use crate::effect::{Effect, ForkHandle};
    pub use crate::env::{CancelSource, CancelToken, Env, Ledger, ResourceKey};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::schedule::Schedule;
}

pub mod config;
pub mod control;
pub mod effect;
pub mod env;
pub mod error;
pub mod runtime;
pub mod schedule;

pub use effect::Effect;
pub use env::Env;
pub use error::{Error, ErrorKind, Result};
pub use schedule::Schedule;

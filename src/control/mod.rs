//! Memoized computations.
//!
//! This module provides the two thunk types behind memoized effects:
//!
//! - [`Thunk`]: thread-safe, at-most-once evaluation of a synchronous function
//! - [`AsyncThunk`]: the same contract for asynchronous functions
//!
//! Both follow the [`ThunkState`] lifecycle: one caller wins an atomic
//! compare-and-swap and evaluates, concurrent callers wait and then read the
//! cached outcome. Failures are cached as well, and cancellation is kept
//! apart from failure so a cancelled evaluation can be retried with
//! `re_value`.
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::control::Thunk;
//! use lambars_effect::env::Env;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let thunk = Arc::new(Thunk::new(|_| Ok(6 * 7)));
//! let env = Env::new();
//!
//! let handles: Vec<_> = (0..8)
//!     .map(|_| {
//!         let thunk = Arc::clone(&thunk);
//!         let env = env.clone();
//!         thread::spawn(move || thunk.value(&env))
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     assert_eq!(handle.join().unwrap(), Ok(42));
//! }
//! ```

mod async_thunk;
mod state;
mod thunk;

pub use async_thunk::{AsyncThunk, AsyncThunkFn};
pub use state::ThunkState;
pub use thunk::{Thunk, ThunkFn};

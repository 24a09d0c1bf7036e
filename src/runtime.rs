//! Bridge to the host tokio runtime.
//!
//! The interpreter itself owns no worker pool. It needs a runtime in three
//! places only: forked effects are spawned onto one, timers for timeouts are
//! driven by one, and the synchronous driver blocks on asynchronous steps.
//!
//! # Handle Priority
//!
//! 1. The affinity handle carried by the [`Env`](crate::env::Env), if any
//! 2. The runtime the caller is currently inside of
//! 3. A lazily built shared multi-thread runtime configured from
//!    [`config::current`](crate::config::current)
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::runtime::try_run_blocking;
//!
//! let result = try_run_blocking(async {
//!     tokio::time::sleep(std::time::Duration::from_millis(1)).await;
//!     42
//! });
//! assert_eq!(result, Ok(42));
//! ```

use std::cell::RefCell;
use std::future::Future;
use std::sync::LazyLock;

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;

use crate::config;

pub use crate::config::configure;

// =============================================================================
// Shared Runtime
// =============================================================================

static SHARED_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    let settings = config::current();
    tracing::debug!(
        worker_threads = settings.worker_threads(),
        thread_name = settings.thread_name(),
        "starting shared effect runtime"
    );
    Builder::new_multi_thread()
        .worker_threads(settings.worker_threads())
        .thread_name(settings.thread_name())
        .enable_all()
        .build()
        .expect("failed to build the shared effect runtime")
});

/// Returns the shared runtime, building it on first use.
#[inline]
#[must_use]
pub fn global() -> &'static Runtime {
    &SHARED_RUNTIME
}

thread_local! {
    static CACHED_HANDLE: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Returns the current runtime's handle, or the shared runtime's handle when
/// called from outside any runtime.
#[must_use]
pub fn handle() -> Handle {
    if let Ok(current) = Handle::try_current() {
        return current;
    }

    CACHED_HANDLE.with(|cached| {
        cached
            .borrow_mut()
            .get_or_insert_with(|| global().handle().clone())
            .clone()
    })
}

/// Spawns a future on `affinity` when given, otherwise on [`handle`].
pub fn spawn<F>(affinity: Option<&Handle>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match affinity {
        Some(pinned) => pinned.spawn(future),
        None => handle().spawn(future),
    }
}

// =============================================================================
// Blocking Execution
// =============================================================================

/// Reasons the synchronous driver cannot block on a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockingError {
    /// `block_in_place` is unavailable inside a current-thread runtime.
    #[error(
        "cannot block inside a current-thread runtime: \
         run the effect with run_async instead"
    )]
    CurrentThreadRuntime,
    /// The runtime flavor is not known to support blocking.
    #[error("cannot block: the runtime flavor is not supported")]
    UnsupportedRuntimeFlavor,
}

/// Drives `future` to completion on the calling thread.
///
/// - Inside a multi-thread runtime: `block_in_place` on the current handle.
/// - Inside a current-thread runtime: [`BlockingError::CurrentThreadRuntime`].
/// - Outside any runtime: `block_on` on the shared runtime.
///
/// # Errors
///
/// Returns a [`BlockingError`] when the calling context cannot block.
pub fn try_run_blocking<F>(future: F) -> Result<F::Output, BlockingError>
where
    F: Future,
{
    match Handle::try_current() {
        Ok(current) => match current.runtime_flavor() {
            RuntimeFlavor::MultiThread => {
                Ok(tokio::task::block_in_place(|| current.block_on(future)))
            }
            RuntimeFlavor::CurrentThread => Err(BlockingError::CurrentThreadRuntime),
            _ => Err(BlockingError::UnsupportedRuntimeFlavor),
        },
        Err(_) => Ok(global().block_on(future)),
    }
}

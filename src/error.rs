//! Error types for the effect runtime.
//!
//! Every failure an effect can produce is an [`Error`]. Errors are cheap to
//! clone because memoized thunks hand the same cached failure to every caller.
//!
//! The taxonomy distinguishes:
//!
//! - **Domain** failures: structured, inspectable values carrying a message and
//!   an optional host error as their cause.
//! - **Panicked**: a lifted function panicked; the payload is kept as text.
//! - **Cancelled**: the environment's cancellation signal fired, or a lifted
//!   function reported cancellation itself.
//! - **Timeout**: a timeout race was lost.
//! - **Bottom**: no value could ever exist (see [`Effect::never`]).
//! - **Blocking**: the synchronous driver could not block on an asynchronous step.
//!
//! [`Effect::never`]: crate::effect::Effect::never
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::{Error, ErrorKind};
//!
//! let error = Error::domain("connection refused");
//! assert_eq!(error.kind(), ErrorKind::Domain);
//! assert_eq!(error.to_string(), "connection refused");
//!
//! let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
//! let error = Error::from_error(io);
//! assert!(error.downcast_ref::<std::io::Error>().is_some());
//! ```

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::BlockingError;

/// A shared, type-erased host error kept as the cause of a domain failure.
pub type ErrorSource = Arc<dyn StdError + Send + Sync + 'static>;

/// Result type used throughout the crate.
pub type Result<A, E = Error> = std::result::Result<A, E>;

/// A failure produced while running an effect.
#[derive(Clone, thiserror::Error)]
pub enum Error {
    /// A structured failure raised by user code.
    #[error("{message}")]
    Domain {
        /// Human readable description.
        message: String,
        /// The host error this failure was converted from, if any.
        #[source]
        source: Option<ErrorSource>,
    },
    /// A lifted function panicked.
    #[error("effect panicked: {message}")]
    Panicked {
        /// The panic payload rendered as text.
        message: String,
    },
    /// The computation observed cancellation.
    #[error("effect was cancelled")]
    Cancelled,
    /// The computation did not finish within its time budget.
    #[error("effect timed out after {duration:?}")]
    Timeout {
        /// The budget that was exceeded.
        duration: Duration,
    },
    /// No value could ever exist here.
    #[error("effect has no value (bottom)")]
    Bottom,
    /// The synchronous driver could not block on an asynchronous step.
    #[error(transparent)]
    Blocking(#[from] BlockingError),
}

/// The discriminant of an [`Error`], convenient for `catch` predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Domain`].
    Domain,
    /// See [`Error::Panicked`].
    Panicked,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::Bottom`].
    Bottom,
    /// See [`Error::Blocking`].
    Blocking,
}

impl Error {
    /// Creates a domain failure from a message.
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain {
            message: message.into(),
            source: None,
        }
    }

    /// Converts a host error into a domain failure, keeping it as the cause.
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Domain {
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    /// Creates a timeout failure for the given budget.
    #[inline]
    pub const fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Renders a panic payload caught with `catch_unwind`.
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|text| (*text).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked { message }
    }

    /// Returns the discriminant of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain { .. } => ErrorKind::Domain,
            Self::Panicked { .. } => ErrorKind::Panicked,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Bottom => ErrorKind::Bottom,
            Self::Blocking(_) => ErrorKind::Blocking,
        }
    }

    /// Returns `true` for cancellation failures.
    #[inline]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` for timeout failures.
    #[inline]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` for the bottom value.
    #[inline]
    pub const fn is_bottom(&self) -> bool {
        matches!(self, Self::Bottom)
    }

    /// Returns the message of a domain or panic failure.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Domain { message, .. } | Self::Panicked { message } => Some(message),
            _ => None,
        }
    }

    /// Downcasts the cause of a domain failure to a concrete host error.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Domain {
                source: Some(source),
                ..
            } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain { message, source } => formatter
                .debug_struct("Domain")
                .field("message", message)
                .field("source", &source.as_ref().map(|cause| cause.to_string()))
                .finish(),
            Self::Panicked { message } => formatter
                .debug_struct("Panicked")
                .field("message", message)
                .finish(),
            Self::Cancelled => formatter.write_str("Cancelled"),
            Self::Timeout { duration } => formatter
                .debug_struct("Timeout")
                .field("duration", duration)
                .finish(),
            Self::Bottom => formatter.write_str("Bottom"),
            Self::Blocking(error) => formatter.debug_tuple("Blocking").field(error).finish(),
        }
    }
}

// Causes are compared by their rendered message; `Arc<dyn Error>` has no equality.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Domain {
                    message: left,
                    source: left_source,
                },
                Self::Domain {
                    message: right,
                    source: right_source,
                },
            ) => {
                left == right
                    && left_source.as_ref().map(ToString::to_string)
                        == right_source.as_ref().map(ToString::to_string)
            }
            (Self::Panicked { message: left }, Self::Panicked { message: right }) => left == right,
            (Self::Timeout { duration: left }, Self::Timeout { duration: right }) => left == right,
            (Self::Blocking(left), Self::Blocking(right)) => left == right,
            (Self::Cancelled, Self::Cancelled) | (Self::Bottom, Self::Bottom) => true,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::from_error(error)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::domain(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Self::domain(message)
    }
}

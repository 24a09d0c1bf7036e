//! Process-wide runtime configuration.
//!
//! The configuration is installed at most once, before the shared tokio
//! runtime is first used. Afterwards it is read-only; [`current`] returns the
//! installed configuration or the defaults.
//!
//! # Examples
//!
//! ```rust
//! use lambars_effect::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default()
//!     .with_worker_threads(2)
//!     .with_thread_name("effect-worker");
//!
//! assert_eq!(config.worker_threads(), 2);
//! assert!(config.validate().is_ok());
//! ```

use std::sync::OnceLock;

/// Errors raised while installing a [`RuntimeConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The configuration was already installed or the runtime already started.
    #[error("runtime configuration is already initialized")]
    AlreadyInitialized,
    /// A field holds a value the runtime cannot use.
    #[error("invalid runtime configuration: {0}")]
    Invalid(String),
}

/// Tunables for the shared runtime and for thunk spin-waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RuntimeConfig {
    worker_threads: usize,
    thread_name: String,
    spin_yield_threshold: u32,
    max_backoff_shift: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            thread_name: "lambars-effect".to_string(),
            spin_yield_threshold: 10,
            max_backoff_shift: 6,
        }
    }
}

impl RuntimeConfig {
    /// Sets the number of worker threads of the shared runtime.
    #[must_use]
    pub const fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Sets the name given to the shared runtime's worker threads.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Sets how many backoff rounds a waiting thunk caller spins before it
    /// starts yielding its thread.
    #[must_use]
    pub const fn with_spin_yield_threshold(mut self, rounds: u32) -> Self {
        self.spin_yield_threshold = rounds;
        self
    }

    /// Sets the largest exponent of the spin backoff (`2^shift` spins per round).
    #[must_use]
    pub const fn with_max_backoff_shift(mut self, shift: u32) -> Self {
        self.max_backoff_shift = shift;
        self
    }

    /// Number of worker threads of the shared runtime.
    pub const fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Name of the shared runtime's worker threads.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Backoff rounds before a waiting thunk caller yields.
    pub const fn spin_yield_threshold(&self) -> u32 {
        self.spin_yield_threshold
    }

    /// Largest exponent of the spin backoff.
    pub const fn max_backoff_shift(&self) -> u32 {
        self.max_backoff_shift
    }

    /// Checks that every field holds a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero worker threads, an empty
    /// thread name, or a backoff shift above 16.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid(
                "thread_name must not be empty".to_string(),
            ));
        }
        if self.max_backoff_shift > 16 {
            return Err(ConfigError::Invalid(format!(
                "max_backoff_shift must be at most 16, got {}",
                self.max_backoff_shift
            )));
        }
        Ok(())
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Installs the process-wide configuration.
///
/// Must be called before the shared runtime is first used (see
/// [`runtime::global`](crate::runtime::global)).
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if the configuration fails validation and
/// [`ConfigError::AlreadyInitialized`] if a configuration is already in place.
pub fn configure(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    tracing::debug!("runtime configuration installed");
    Ok(())
}

/// Returns the installed configuration, installing the defaults on first use.
pub fn current() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_default_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.worker_threads() >= 1);
        assert_eq!(config.thread_name(), "lambars-effect");
        assert_eq!(config.validate(), Ok(()));
    }

    #[rstest]
    fn test_builder_sets_fields() {
        let config = RuntimeConfig::default()
            .with_worker_threads(3)
            .with_thread_name("worker")
            .with_spin_yield_threshold(4)
            .with_max_backoff_shift(2);

        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.thread_name(), "worker");
        assert_eq!(config.spin_yield_threshold(), 4);
        assert_eq!(config.max_backoff_shift(), 2);
    }

    #[rstest]
    #[case(RuntimeConfig::default().with_worker_threads(0))]
    #[case(RuntimeConfig::default().with_thread_name(""))]
    #[case(RuntimeConfig::default().with_max_backoff_shift(17))]
    fn test_invalid_configurations(#[case] config: RuntimeConfig) {
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[rstest]
    fn test_configure_rejects_invalid_before_touching_global() {
        let result = configure(RuntimeConfig::default().with_worker_threads(0));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[cfg(feature = "serde")]
    #[rstest]
    fn test_serde_fills_missing_fields_with_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "worker_threads": 2 }"#).expect("valid json");
        assert_eq!(config.worker_threads(), 2);
        assert_eq!(config.thread_name(), "lambars-effect");
    }
}

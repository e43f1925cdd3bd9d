//! Synchronization utilities for robust mutex handling
//!
//! Converts mutex poisoning into module-specific errors so library code
//! never unwraps a lock result.

use std::sync::LockResult;

/// Handle poisoned mutex cases with consistent error handling
///
/// Converts a poison error from a `Mutex::lock()` call into an
/// application-specific error using the provided constructor.
///
/// # Examples
/// ```
/// use std::sync::Mutex;
/// use pubsub_dispatch::core::sync::handle_mutex_poison;
/// use pubsub_dispatch::broker::api::{BrokerError, ErrorClass};
///
/// let mutex = Mutex::new(42);
/// let guard = handle_mutex_poison(mutex.lock(), |msg| {
///     BrokerError::new(ErrorClass::InternalServerError, msg)
/// })
/// .unwrap();
/// assert_eq!(*guard, 42);
/// ```
pub fn handle_mutex_poison<T, E>(
    result: LockResult<T>,
    error_constructor: impl FnOnce(String) -> E,
) -> Result<T, E> {
    result.map_err(|poison_err| {
        error_constructor(format!(
            "Internal synchronisation error (mutex poisoned). This indicates a panic occurred while holding a lock. PoisonError: {:?}",
            poison_err
        ))
    })
}

//! Small helpers shared across modules.

use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Collision-resistant random id for endpoints, envelopes and requests.
pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lock a mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

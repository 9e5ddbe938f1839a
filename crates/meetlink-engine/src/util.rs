use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering from poison (a task panicked while holding it).
pub(crate) fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

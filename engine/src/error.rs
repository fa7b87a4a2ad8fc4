use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("bad value")]
    BadValue,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("out of memory")]
    NoMemory,
    #[error("not initialized")]
    NoInit,
    #[error("no such device")]
    NoDevice,
    #[error("not ready")]
    NotReady,
    #[error("device error: {0}")]
    Device(String),
}

pub type HalResult<T> = Result<T, HalError>;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Poison-tolerant lock access
//!
//! A panic inside a short state update must not wedge every later caller,
//! so poisoned guards are recovered and used as-is.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

pub(crate) fn read_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("RwLock was poisoned, recovering for read");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("RwLock was poisoned, recovering for write");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

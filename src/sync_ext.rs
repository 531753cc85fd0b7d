use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    WaitTimeoutResult,
};
use std::time::Duration;

/// Lock helpers that recover from poisoning instead of panicking.
///
/// Worker threads guard stage execution with `catch_unwind`, so a panic in one
/// job must not take down every other holder of the same lock.
pub(crate) trait MutexExt<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) trait RwLockExt<T> {
    fn read_unpoisoned(&self) -> RwLockReadGuard<'_, T>;
    fn write_unpoisoned(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_unpoisoned(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_unpoisoned(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) trait CondvarExt {
    fn wait_unpoisoned<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T>;

    fn wait_timeout_unpoisoned<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult);
}

impl CondvarExt for Condvar {
    fn wait_unpoisoned<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout_unpoisoned<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.wait_timeout(guard, dur)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Condvar, Mutex, RwLock};
    use std::time::Duration;

    use super::*;

    #[test]
    fn mutex_lock_survives_a_poisoning_panic() {
        let lock = Arc::new(Mutex::new(0u32));
        let lock_clone = lock.clone();
        let _ = std::thread::spawn(move || {
            let mut guard = lock_clone.lock().unwrap();
            *guard = 7;
            panic!("poison");
        })
        .join();

        assert_eq!(*lock.lock_unpoisoned(), 7);
    }

    #[test]
    fn rwlock_read_survives_a_poisoning_panic() {
        let lock = Arc::new(RwLock::new(1u32));
        let lock_clone = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("poison");
        })
        .join();

        assert_eq!(*lock.read_unpoisoned(), 1);
    }

    #[test]
    fn condvar_wait_timeout_returns_after_poison() {
        let lock = Arc::new(Mutex::new(()));
        let lock_clone = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        let cv = Condvar::new();
        let guard = lock.lock_unpoisoned();
        let (_guard, timeout) = cv.wait_timeout_unpoisoned(guard, Duration::from_millis(1));
        assert!(timeout.timed_out());
    }
}

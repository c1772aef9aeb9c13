//! Lock helpers. A panic while holding a lock does not leave the guarded
//! state inconsistent, so poisoning is ignored.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_poisoned_locks_stay_usable() {
        let rw = Arc::new(RwLock::new(1));
        let mutex = Arc::new(Mutex::new(1));
        let (rw2, mutex2) = (Arc::clone(&rw), Arc::clone(&mutex));
        let result = std::thread::spawn(move || {
            let _rw = rw2.write().unwrap();
            let _m = mutex2.lock().unwrap();
            panic!("poison both");
        })
        .join();
        assert!(result.is_err());
        assert!(rw.is_poisoned());
        assert!(mutex.is_poisoned());

        *write_lock(&rw) += 1;
        assert_eq!(*read_lock(&rw), 2);
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}

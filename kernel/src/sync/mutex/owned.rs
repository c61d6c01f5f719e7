use super::super::{AtomicTid, Tid};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

/// A mutex that remembers which thread holds it.
///
/// Thread identity is passed in explicitly because the scheduler lives outside
/// this crate. The point of recording the holder is [`OwnedMutex::lock_unless_held`]:
/// a page fault taken while the faulting thread already holds the lock (for
/// example, a `read` system call copying file data into a not-yet-loaded user
/// buffer) must not try to take it again.
pub struct OwnedMutex<T: ?Sized> {
    holding_thread: AtomicTid,
    data: UnsafeCell<T>,
}

pub struct OwnedMutexGuard<'a, T: ?Sized + 'a> {
    mutex: Option<&'a OwnedMutex<T>>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for OwnedMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for OwnedMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for OwnedMutexGuard<'_, T> {}
unsafe impl<T: ?Sized + Send> Send for OwnedMutexGuard<'_, T> {}

impl<'a, T: ?Sized> OwnedMutexGuard<'a, T> {
    pub fn unlock(&mut self) {
        if let Some(mutex) = self.mutex.take() {
            mutex.unlock();
        }
    }
}

// Ensure mutex is released if dropped (such as in the event of a panic)
impl<'a, T: ?Sized> Drop for OwnedMutexGuard<'a, T> {
    fn drop(&mut self) {
        if let Some(mutex) = self.mutex.take() {
            mutex.unlock();
        }
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for OwnedMutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.mutex {
            Some(_) => fmt::Debug::fmt(&**self, f),
            None => f.write_str("OwnedMutexGuard(unlocked)"),
        }
    }
}

impl<'a, T: ?Sized> Deref for OwnedMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        let mutex = self.mutex.expect("guard used after unlock");
        // SAFETY: The guard exists only while the mutex is held by its thread.
        unsafe { &*mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for OwnedMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        let mutex = self.mutex.expect("guard used after unlock");
        // SAFETY: The guard exists only while the mutex is held by its thread.
        unsafe { &mut *mutex.data.get() }
    }
}

impl<T: ?Sized + Default> Default for OwnedMutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> OwnedMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            holding_thread: AtomicTid::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> OwnedMutex<T> {
    /// # Panics
    ///
    /// Panics if `tid` already holds the lock, since that would deadlock.
    #[must_use = "Mutex is released when guard falls out of scope."]
    pub fn lock(&self, tid: Tid) -> OwnedMutexGuard<'_, T> {
        assert_ne!(tid, 0, "thread id 0 is reserved");
        assert!(!self.held_by(tid), "thread {tid} already holds this lock");

        while self
            .holding_thread
            .compare_exchange(0, tid, AcqRel, Acquire)
            .is_err()
        {
            core::hint::spin_loop();
        }

        OwnedMutexGuard { mutex: Some(self) }
    }

    /// Takes the lock for `tid` unless `tid` already holds it.
    ///
    /// Returns `None` in the already-held case; the caller keeps running under
    /// the outer acquisition and must not release it.
    #[must_use = "Mutex is released when guard falls out of scope."]
    pub fn lock_unless_held(&self, tid: Tid) -> Option<OwnedMutexGuard<'_, T>> {
        if self.held_by(tid) {
            return None;
        }
        Some(self.lock(tid))
    }

    fn unlock(&self) {
        self.holding_thread.store(0, Release);
    }

    pub fn held_by(&self, tid: Tid) -> bool {
        self.holding_thread.load(Acquire) == tid
    }

    pub fn is_locked(&self) -> bool {
        self.holding_thread.load(Acquire) != 0
    }

    pub fn try_lock(&self, tid: Tid) -> Option<OwnedMutexGuard<'_, T>> {
        assert_ne!(tid, 0, "thread id 0 is reserved");
        self.holding_thread
            .compare_exchange(0, tid, AcqRel, Acquire)
            .ok()
            .map(|_| OwnedMutexGuard { mutex: Some(self) })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_holder() {
        let lock = OwnedMutex::new(());
        assert!(!lock.is_locked());
        let guard = lock.lock(3);
        assert!(lock.held_by(3));
        assert!(!lock.held_by(4));
        assert!(lock.try_lock(4).is_none());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn skips_reacquisition_by_holder() {
        let lock = OwnedMutex::new(0);
        let mut outer = lock.lock(7);
        assert!(lock.lock_unless_held(7).is_none());
        assert!(lock.held_by(7));
        *outer += 1;
        outer.unlock();
        let inner = lock.lock_unless_held(7).expect("lock is free");
        assert_eq!(*inner, 1);
    }

    #[test]
    #[should_panic]
    fn relocking_panics() {
        let lock = OwnedMutex::new(());
        let _outer = lock.lock(1);
        let _inner = lock.lock(1);
    }
}

//! RAII wrappers around [`Lock`].

use crate::locking::mutex::Lock;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// Holds `lock` for as long as the guard lives.
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl<'a> LockGuard<'a> {
    /// Acquires `lock`, releasing it again when dropped.
    pub fn new(lock: &'a Lock) -> Self {
        lock.lock();
        LockGuard { lock }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A value permanently paired with the [`Lock`] that guards it. All access
/// goes through a guard, so the data cannot be touched without holding the
/// lock.
pub struct Locked<T> {
    lock: Lock,
    data: UnsafeCell<T>,
}

// Access to `data` is serialized by `lock`.
unsafe impl<T: Send> Sync for Locked<T> {}
unsafe impl<T: Send> Send for Locked<T> {}

impl<T> Locked<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Locked {
            lock: Lock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    /// Blocks until the data is available.
    pub fn lock(&self) -> LockedGuard<'_, T> {
        self.lock.lock();
        LockedGuard { inner: self }
    }

    /// Single attempt; `None` if another holder is active.
    pub fn try_lock(&self) -> Option<LockedGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(LockedGuard { inner: self })
        } else {
            None
        }
    }

    /// The underlying mutex, e.g. for attaching a scheduler.
    pub fn mutex(&self) -> &Lock {
        &self.lock
    }
}

/// Grants access to the data of a [`Locked`] while alive.
pub struct LockedGuard<'a, T> {
    inner: &'a Locked<T>,
}

impl<T> Deref for LockedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.inner.data.get() }
    }
}

impl<T> DerefMut for LockedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.inner.data.get() }
    }
}

impl<T> Drop for LockedGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.lock.unlock();
    }
}

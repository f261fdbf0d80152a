use crate::platform;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// An interrupt-safe mutual exclusion primitive.
///
/// Acquisition spins on the platform lock word with interrupts disabled on
/// the current core; release restores the saved interrupt state. This
/// makes the protected data safe to touch from any context, task or
/// interrupt, on any core — at the price of delaying higher-priority
/// threads for the duration of the critical section, which should
/// therefore be as short as possible.
///
/// The data can only be accessed through the RAII guard returned from
/// [`lock`](Self::lock), so it is only ever accessed while the lock is
/// held.
pub struct Spinlock<T: ?Sized> {
    lock: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a spinlock. When this
/// structure is dropped (falls out of scope), the lock will be released
/// and the interrupt state restored.
#[must_use = "if unused the Spinlock will immediately unlock"]
pub struct SpinlockGuard<'a, T: ?Sized> {
    spinlock: &'a Spinlock<T>,
    save: u32,
}

unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self { lock: UnsafeCell::new(0), data: UnsafeCell::new(data) }
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquires the lock, spinning with interrupts disabled until it is
    /// available.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let save = platform::spin_lock_irq_save(self.lock.get());
        SpinlockGuard { spinlock: self, save }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Spinlock` mutably, no actual locking
    /// needs to take place.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock").finish_non_exhaustive()
    }
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.spinlock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.spinlock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        platform::spin_unlock_irq_restore(self.spinlock.lock.get(), self.save);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_unlock() {
        let lock = Spinlock::new(1);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn get_mut() {
        let mut lock = Spinlock::new(10);
        *lock.get_mut() = 20;
        assert_eq!(*lock.lock(), 20);
    }

    #[test]
    fn contended() {
        let lock = Arc::new(Spinlock::new(0_u32));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}

//! Synchronization primitives.

mod spinlock;

pub use self::spinlock::{Spinlock, SpinlockGuard};

//! Shared-descriptor coherence.
//!
//! On DSPs with a non-coherent interconnect, a core that updates an
//! allocator descriptor (a block map, a heap, the memory map itself) must
//! publish the write before another core can observe it. Rather than
//! hand-auditing every mutation site, descriptors implement [`Coherent`]
//! and are mutated through the [`Shared`] guard, which publishes the
//! descriptor via [`platform::shared_commit`] when it drops. Read-only
//! scan paths call [`Coherent::commit`] on their exits directly.
//!
//! On cache-coherent targets the commit hook is a no-op and the guard
//! compiles away.

use crate::platform;
use core::mem;
use core::ops::{Deref, DerefMut};

/// A descriptor shared between cores.
pub trait Coherent: Sized {
    /// Publishes the descriptor to the other cores.
    #[inline]
    fn commit(&self) {
        platform::shared_commit(self as *const Self as *const u8, mem::size_of::<Self>());
    }

    /// Borrows the descriptor for mutation; the mutation is published when
    /// the returned guard drops.
    #[inline]
    fn shared(&mut self) -> Shared<'_, Self> {
        Shared { data: self }
    }
}

/// An RAII guard over a mutably borrowed [`Coherent`] descriptor.
///
/// Dereferences to the descriptor; runs [`Coherent::commit`] on drop.
#[must_use = "if unused the descriptor is committed immediately"]
pub struct Shared<'a, T: Coherent> {
    data: &'a mut T,
}

impl<T: Coherent> Deref for Shared<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: Coherent> DerefMut for Shared<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T: Coherent> Drop for Shared<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.data.commit();
    }
}

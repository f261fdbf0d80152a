//! Platform services.
//!
//! The memory core is platform-agnostic. The firmware image links the
//! `adsp_*` hooks declared here: core identification, shared-memory
//! translation and publication, the interrupt-saving spinlock primitive,
//! and the fatal panic channel. With the `std` cargo feature (or under
//! `cargo test`) the hooks are replaced with functional host fallbacks, so
//! the allocator runs unmodified on a development machine.

#[cfg(any(test, feature = "std"))]
use core::cell::Cell;
#[cfg(any(test, feature = "std"))]
use core::sync::atomic::{AtomicU32, Ordering};

/// Data cache line size in bytes. Power of two.
///
/// Zone allocations are padded so that returned addresses never share a
/// cache line with a neighbouring allocation.
pub const DCACHE_ALIGN: usize = 64;

/// The core that boots the image and owns the IPC channel to the host.
pub const MASTER_CORE: u32 = 0;

/// Panic codes reported through the platform panic channel.
///
/// The code ends up in a host-visible register, so the values are ABI and
/// must not be reordered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum PanicCode {
    /// Memory subsystem invariant violation or exhaustion.
    Mem = 0x2,
    /// IPC protocol failure.
    Ipc = 0x3,
    /// Task scheduler failure.
    Task = 0x4,
    /// Unhandled CPU exception.
    Exception = 0x5,
}

#[cfg(not(any(test, feature = "std")))]
extern "C" {
    fn adsp_cpu_id() -> u32;
    fn adsp_panic(code: u32) -> !;
    fn adsp_shared_get(ptr: *mut u8, size: usize) -> *mut u8;
    fn adsp_shared_commit(ptr: *const u8, size: usize);
    fn adsp_free_prepare(ptr: *mut u8) -> *mut u8;
    fn adsp_spin_lock_irq_save(lock: *mut u32) -> u32;
    fn adsp_spin_unlock_irq_restore(lock: *mut u32, save: u32);
}

#[cfg(any(test, feature = "std"))]
std::thread_local! {
    static HOST_CPU_ID: Cell<u32> = const { Cell::new(0) };
}

/// Returns the id of the executing core.
#[inline]
pub fn cpu_id() -> u32 {
    #[cfg(any(test, feature = "std"))]
    return HOST_CPU_ID.with(Cell::get);
    #[cfg(not(any(test, feature = "std")))]
    unsafe {
        adsp_cpu_id()
    }
}

/// Overrides [`cpu_id`] for the current host thread.
#[cfg(any(test, feature = "std"))]
pub fn set_cpu_id(core: u32) {
    HOST_CPU_ID.with(|id| id.set(core));
}

/// Reports a fatal condition to the host and halts the DSP.
#[inline]
pub fn panic(code: PanicCode) -> ! {
    #[cfg(any(test, feature = "std"))]
    panic!("platform panic: {:?} ({:#x})", code, code as u32);
    #[cfg(not(any(test, feature = "std")))]
    unsafe {
        adsp_panic(code as u32)
    }
}

/// Translates a local address into its shared, cross-core coherent view.
#[inline]
pub fn shared_get(ptr: *mut u8, size: usize) -> *mut u8 {
    #[cfg(any(test, feature = "std"))]
    {
        let _ = size;
        ptr
    }
    #[cfg(not(any(test, feature = "std")))]
    unsafe {
        adsp_shared_get(ptr, size)
    }
}

/// Publishes local writes to `size` bytes at `ptr` to the other cores.
///
/// A write-back of the dirty lines covering the range on DSPs with a
/// non-coherent interconnect; a no-op on coherent targets.
#[inline]
pub fn shared_commit(ptr: *const u8, size: usize) {
    #[cfg(any(test, feature = "std"))]
    {
        let _ = (ptr, size);
    }
    #[cfg(not(any(test, feature = "std")))]
    unsafe {
        adsp_shared_commit(ptr, size);
    }
}

/// Reverses any shared-memory translation applied to an allocated pointer,
/// so that the result lies within its owning heap's native address range.
#[inline]
pub fn free_prepare(ptr: *mut u8) -> *mut u8 {
    #[cfg(any(test, feature = "std"))]
    return ptr;
    #[cfg(not(any(test, feature = "std")))]
    unsafe {
        adsp_free_prepare(ptr)
    }
}

/// Acquires the spinlock at `lock`, disabling interrupts on the current
/// core. Returns the saved interrupt state.
#[inline]
pub(crate) fn spin_lock_irq_save(lock: *mut u32) -> u32 {
    #[cfg(any(test, feature = "std"))]
    {
        let lock = unsafe { &*(lock as *const AtomicU32) };
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        0
    }
    #[cfg(not(any(test, feature = "std")))]
    unsafe {
        adsp_spin_lock_irq_save(lock)
    }
}

/// Releases the spinlock at `lock` and restores the interrupt state
/// returned by the matching [`spin_lock_irq_save`].
#[inline]
pub(crate) fn spin_unlock_irq_restore(lock: *mut u32, save: u32) {
    #[cfg(any(test, feature = "std"))]
    {
        let _ = save;
        let lock = unsafe { &*(lock as *const AtomicU32) };
        lock.store(0, Ordering::Release);
    }
    #[cfg(not(any(test, feature = "std")))]
    unsafe {
        adsp_spin_unlock_irq_restore(lock, save);
    }
}

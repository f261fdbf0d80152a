use crate::heap::heap::Heap;
#[cfg(feature = "poison")]
use crate::heap::map::POISON_BYTE;
use crate::heap::{Caps, Flags, Zone};
use crate::platform::{self, PanicCode};
use crate::shared::Coherent;
use crate::sync::{Spinlock, SpinlockGuard};
use crate::trace::trace_mem_error;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::slice;

/// Static storage for a heap category array.
///
/// Declared by the [`mem_map!`](crate::mem_map) macro; all access is
/// serialized by the global allocator lock.
#[repr(transparent)]
pub struct HeapStorage<const N: usize>(UnsafeCell<[Heap; N]>);

unsafe impl<const N: usize> Sync for HeapStorage<N> {}

impl<const N: usize> HeapStorage<N> {
    /// Wraps a heap array.
    pub const fn new(heaps: [Heap; N]) -> Self {
        Self(UnsafeCell::new(heaps))
    }

    /// Pointer to the first heap.
    pub const fn as_mut_ptr(&self) -> *mut Heap {
        self.0.get() as *mut Heap
    }
}

/// One category of heaps inside the memory map.
pub struct HeapArray {
    heaps: *mut Heap,
    len: u32,
}

unsafe impl Send for HeapArray {}

impl HeapArray {
    /// Creates a category over the heap storage at `heaps`.
    pub const fn new(heaps: *mut Heap, len: u32) -> Self {
        Self { heaps, len }
    }

    /// A category with no heaps.
    pub const fn empty() -> Self {
        Self { heaps: ptr::null_mut(), len: 0 }
    }

    fn as_slice(&self) -> &[Heap] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.heaps, self.len as usize) }
        }
    }

    fn as_mut_slice(&mut self) -> &mut [Heap] {
        if self.len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.heaps, self.len as usize) }
        }
    }
}

/// The process-wide memory map: every heap of the image, partitioned into
/// the four zone categories.
///
/// Constructed once, by the [`mem_map!`](crate::mem_map) macro in the
/// firmware image or by hand on a test host, and never destroyed. The
/// map exclusively owns all heap descriptors; allocated pointers are lent
/// to callers between allocation and free.
pub struct MemMap {
    system: HeapArray,
    system_runtime: HeapArray,
    runtime: HeapArray,
    buffer: HeapArray,
    trace_dirty: bool,
}

impl MemMap {
    /// Creates the memory map from its four heap categories.
    ///
    /// `system` and `system_runtime` hold one heap per core, indexed by
    /// core id; `runtime` and `buffer` are shared across cores and tried
    /// in declaration order.
    pub const fn new(
        system: HeapArray,
        system_runtime: HeapArray,
        runtime: HeapArray,
        buffer: HeapArray,
    ) -> Self {
        Self { system, system_runtime, runtime, buffer, trace_dirty: false }
    }

    /// Per-core `System` bump arenas.
    pub fn system(&self) -> &[Heap] {
        self.system.as_slice()
    }

    /// Per-core `SystemRuntime` heaps.
    pub fn system_runtime(&self) -> &[Heap] {
        self.system_runtime.as_slice()
    }

    /// Cross-core `Runtime` heaps.
    pub fn runtime(&self) -> &[Heap] {
        self.runtime.as_slice()
    }

    /// `Buffer` heaps.
    pub fn buffer(&self) -> &[Heap] {
        self.buffer.as_slice()
    }

    pub(crate) fn trace_dirty(&self) -> bool {
        self.trace_dirty
    }

    pub(crate) fn set_trace_dirty(&mut self, dirty: bool) {
        self.trace_dirty = dirty;
    }

    /// Serves the `System` zone from the bump arena owned by `core`.
    /// Exhaustion is fatal: the arena holds boot-time driver state and
    /// there is no recovery path.
    fn alloc_sys(&mut self, flags: Flags, caps: Caps, core: u32, bytes: usize) -> usize {
        let heap = &mut self.system.as_mut_slice()[core as usize];
        if !heap.has_caps(caps) {
            platform::panic(PanicCode::Mem);
        }
        let Some(addr) = heap.bump_alloc(bytes) else {
            heap.commit();
            trace_mem_error!("system alloc failed: core = {}, bytes = {}", core, bytes);
            platform::panic(PanicCode::Mem);
        };
        let addr = shared_remap(addr, flags, bytes);
        heap.commit();
        addr
    }

    /// Serves the `SystemRuntime` zone from the heap owned by `core`.
    fn alloc_sys_runtime(&mut self, flags: Flags, caps: Caps, core: u32, bytes: usize) -> Option<usize> {
        let heap = &mut self.system_runtime.as_mut_slice()[core as usize];
        if !heap.has_caps(caps) {
            platform::panic(PanicCode::Mem);
        }
        let addr = heap.alloc_fit(bytes, platform::DCACHE_ALIGN);
        heap.commit();
        addr.map(|addr| shared_remap(addr, flags, bytes))
    }

    /// Serves the `Runtime` zone from the first runtime heap covering
    /// `caps`, falling back to the buffer heaps.
    fn alloc_runtime(&mut self, flags: Flags, caps: Caps, bytes: usize) -> Option<usize> {
        let heap = match heap_with_caps(self.runtime.as_slice(), caps) {
            Some(index) => &mut self.runtime.as_mut_slice()[index],
            None => match heap_with_caps(self.buffer.as_slice(), caps) {
                Some(index) => &mut self.buffer.as_mut_slice()[index],
                None => {
                    trace_mem_error!(
                        "runtime alloc failed: caps = {:#x}, bytes = {}",
                        caps.bits(),
                        bytes
                    );
                    return None;
                }
            },
        };
        let addr = heap.alloc_fit(bytes, platform::DCACHE_ALIGN);
        heap.commit();
        addr.map(|addr| shared_remap(addr, flags, bytes))
    }

    /// Serves the `Buffer` zone, retrying successive capability-matching
    /// heaps on allocation failure.
    fn balloc(&mut self, flags: Flags, caps: Caps, bytes: usize, alignment: usize) -> Option<usize> {
        let mut from = 0;
        while from < self.buffer.as_slice().len() {
            let Some(offset) = heap_with_caps(&self.buffer.as_slice()[from..], caps) else {
                break;
            };
            let index = from + offset;
            let addr = self.buffer.as_mut_slice()[index].alloc_buffer(bytes, alignment);
            if let Some(addr) = addr {
                return Some(shared_remap(addr, flags, bytes));
            }
            from = index + 1;
        }
        None
    }

    fn alloc_unlocked(&mut self, zone: Zone, flags: Flags, caps: Caps, bytes: usize) -> Option<usize> {
        let addr = match zone {
            Zone::System => Some(self.alloc_sys(flags, caps, platform::cpu_id(), bytes)),
            Zone::SystemRuntime => {
                self.alloc_sys_runtime(flags, caps, platform::cpu_id(), bytes)
            }
            Zone::Runtime => self.alloc_runtime(flags, caps, bytes),
            Zone::Buffer => self.balloc(flags, caps, bytes, platform::DCACHE_ALIGN),
        };
        #[cfg(feature = "poison")]
        if let Some(addr) = addr {
            unsafe { ptr::write_bytes(addr as *mut u8, 0, bytes) };
        }
        self.trace_dirty = true;
        self.commit();
        addr
    }

    fn heap_from_ptr_mut(&mut self, addr: usize) -> Option<&mut Heap> {
        let core = platform::cpu_id() as usize;
        if let Some(heap) = self.system_runtime.as_slice().get(core) {
            if heap.contains(addr) {
                return Some(&mut self.system_runtime.as_mut_slice()[core]);
            }
            heap.commit();
        }
        if let Some(index) = heap_containing(self.runtime.as_slice(), addr) {
            return Some(&mut self.runtime.as_mut_slice()[index]);
        }
        if let Some(index) = heap_containing(self.buffer.as_slice(), addr) {
            return Some(&mut self.buffer.as_mut_slice()[index]);
        }
        None
    }

    fn free_unlocked(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let addr = platform::free_prepare(ptr) as usize;
        let core = platform::cpu_id();
        if let Some(heap) = self.system.as_slice().get(core as usize) {
            if heap.contains(addr) {
                trace_mem_error!(
                    "free: attempt to free system heap, ptr = {:#x}, cpu = {}",
                    addr,
                    core
                );
                platform::panic(PanicCode::Mem);
            }
            heap.commit();
        }
        let Some(heap) = self.heap_from_ptr_mut(addr) else {
            trace_mem_error!("free: invalid heap, ptr = {:#x}, cpu = {}", addr, core);
            return;
        };
        heap.free(addr);
        self.trace_dirty = true;
        self.commit();
    }

    /// Copies `bytes` from `old` into the fresh allocation at `new`, then
    /// frees `old`. `old` may be null, in which case nothing is copied.
    unsafe fn copy_and_free(&mut self, old: *mut u8, new: usize, bytes: usize) {
        if !old.is_null() {
            unsafe { ptr::copy_nonoverlapping(old as *const u8, new as *mut u8, bytes) };
        }
        self.free_unlocked(old);
    }

    /// Assigns block map base addresses: the first map starts at the heap
    /// base, every following map right after the previous one's blocks.
    fn init_maps(heaps: &mut [Heap]) {
        for heap in heaps {
            let mut base = heap.base();
            for map in heap.maps_mut() {
                let mut map = map.shared();
                map.set_base(base);
                base += map.span();
            }
            heap.commit();
        }
    }
}

impl Coherent for MemMap {}

/// First heap covering `caps`; every heap examined and passed over is
/// committed on the way, like any other read of a shared descriptor.
fn heap_with_caps(heaps: &[Heap], caps: Caps) -> Option<usize> {
    for (index, heap) in heaps.iter().enumerate() {
        if heap.has_caps(caps) {
            return Some(index);
        }
        heap.commit();
    }
    None
}

/// First heap whose region contains `addr`, committing the heaps passed
/// over.
fn heap_containing(heaps: &[Heap], addr: usize) -> Option<usize> {
    for (index, heap) in heaps.iter().enumerate() {
        if heap.contains(addr) {
            return Some(index);
        }
        heap.commit();
    }
    None
}

fn shared_remap(addr: usize, flags: Flags, bytes: usize) -> usize {
    if flags.contains(Flags::SHARED) {
        platform::shared_get(addr as *mut u8, bytes) as usize
    } else {
        addr
    }
}

fn into_ptr(addr: Option<usize>) -> Option<NonNull<u8>> {
    addr.and_then(|addr| NonNull::new(addr as *mut u8))
}

/// Error of the power-management context operations: the allocator keeps
/// no persistent context on this target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Unsupported;

/// The allocator front end: the process-wide memory map behind the global
/// interrupt-safe spinlock.
///
/// Every public operation acquires the lock for its whole duration, so
/// the entry points are safe to call from any core and any context, task
/// or interrupt. No operation suspends or performs I/O; run time is
/// bounded by the total number of blocks in the map.
pub struct Mm {
    mm: Spinlock<MemMap>,
}

impl Mm {
    /// Creates the allocator around a memory map, normally the static
    /// table declared by [`mem_map!`](crate::mem_map).
    pub const fn new(mm: MemMap) -> Self {
        Self { mm: Spinlock::new(mm) }
    }

    pub(crate) fn lock(&self) -> SpinlockGuard<'_, MemMap> {
        self.mm.lock()
    }

    /// Initializes the memory map. Must run once at boot, before the
    /// first allocation.
    ///
    /// Validates the configured system heap base against the
    /// linker-provided `system_base` (a mismatch means a malformed image
    /// or a loader issue and panics), then assigns every block map its
    /// base address. With the `poison` feature the runtime and buffer
    /// regions are filled with the poison pattern.
    ///
    /// # Safety
    ///
    /// The configured heap regions must be backed by memory that is valid
    /// for reads and writes and used by nothing else.
    pub unsafe fn init(&self, system_base: usize) {
        let mut mm = self.mm.lock();
        // Sanity check for malformed images or loader issues.
        let valid = mm.system.as_slice().first().map_or(false, |heap| heap.base() == system_base);
        if !valid {
            platform::panic(PanicCode::Mem);
        }
        MemMap::init_maps(mm.system_runtime.as_mut_slice());
        MemMap::init_maps(mm.runtime.as_mut_slice());
        MemMap::init_maps(mm.buffer.as_mut_slice());
        #[cfg(feature = "poison")]
        {
            write_pattern(mm.buffer.as_mut_slice());
            write_pattern(mm.runtime.as_mut_slice());
        }
        mm.commit();
    }

    /// Allocates `bytes` from `zone`, served only from a heap whose
    /// capabilities cover `caps`.
    ///
    /// Returns `None` on exhaustion of the `SystemRuntime`, `Runtime` and
    /// `Buffer` zones. `System` zone exhaustion panics, as does a
    /// capability mismatch on a per-core heap: both are static
    /// configuration errors.
    pub fn alloc(&self, zone: Zone, flags: Flags, caps: Caps, bytes: usize) -> Option<NonNull<u8>> {
        let addr = self.mm.lock().alloc_unlocked(zone, flags, caps, bytes);
        #[cfg(feature = "heaptrace")]
        if addr.is_none() {
            self.trace_alloc_failure(zone, flags, caps, bytes);
        }
        into_ptr(addr)
    }

    /// Allocates zeroed memory; otherwise identical to [`alloc`](Self::alloc).
    pub fn alloc_zeroed(
        &self,
        zone: Zone,
        flags: Flags,
        caps: Caps,
        bytes: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = self.alloc(zone, flags, caps, bytes)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Some(ptr)
    }

    /// Allocates a buffer of `bytes` aligned to `alignment` (a power of
    /// two, or zero for no requirement) from the buffer heaps.
    ///
    /// Heaps matching `caps` are tried in declaration order; within a
    /// heap the request is served from the smallest single block that
    /// fits, or else from a contiguous block run.
    pub fn alloc_buffer_aligned(
        &self,
        flags: Flags,
        caps: Caps,
        bytes: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let addr = {
            let mut mm = self.mm.lock();
            let addr = mm.balloc(flags, caps, bytes, alignment);
            #[cfg(feature = "poison")]
            if let Some(addr) = addr {
                unsafe { ptr::write_bytes(addr as *mut u8, 0, bytes) };
            }
            mm.commit();
            addr
        };
        #[cfg(feature = "heaptrace")]
        if addr.is_none() {
            self.trace_alloc_failure(Zone::Buffer, flags, caps, bytes);
        }
        into_ptr(addr)
    }

    /// Frees an allocation.
    ///
    /// Freeing null is a no-op. A pointer outside every known heap is a
    /// caller error: it is logged and ignored rather than crashing the
    /// DSP. A pointer into the executing core's system arena panics —
    /// system memory is never freed.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed
    /// since, and no references into the allocation may outlive this
    /// call.
    pub unsafe fn free(&self, ptr: *mut u8) {
        self.mm.lock().free_unlocked(ptr);
    }

    /// Reallocates `ptr` to `bytes` bytes in `zone`: allocates new
    /// memory, copies, then frees `ptr`. If the new allocation fails,
    /// `None` is returned and `ptr` stays untouched and valid.
    ///
    /// # Safety
    ///
    /// As for [`free`](Self::free); additionally the old allocation must
    /// be readable up to `bytes` — the allocator does not record
    /// allocation sizes and copies the new size.
    pub unsafe fn realloc(
        &self,
        ptr: *mut u8,
        zone: Zone,
        flags: Flags,
        caps: Caps,
        bytes: usize,
    ) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        let addr = {
            let mut mm = self.mm.lock();
            let new = mm.alloc_unlocked(zone, flags, caps, bytes);
            if let Some(new) = new {
                unsafe { mm.copy_and_free(ptr, new, bytes) };
            }
            new
        };
        #[cfg(feature = "heaptrace")]
        if addr.is_none() {
            self.trace_alloc_failure(zone, flags, caps, bytes);
        }
        into_ptr(addr)
    }

    /// Reallocates a buffer with explicit alignment; the buffer-heap
    /// counterpart of [`realloc`](Self::realloc).
    ///
    /// # Safety
    ///
    /// As for [`realloc`](Self::realloc).
    pub unsafe fn realloc_buffer_aligned(
        &self,
        ptr: *mut u8,
        flags: Flags,
        caps: Caps,
        bytes: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        let addr = {
            let mut mm = self.mm.lock();
            let new = mm.balloc(flags, caps, bytes, alignment);
            if let Some(new) = new {
                #[cfg(feature = "poison")]
                unsafe {
                    ptr::write_bytes(new as *mut u8, 0, bytes)
                };
                unsafe { mm.copy_and_free(ptr, new, bytes) };
            }
            mm.commit();
            new
        };
        #[cfg(feature = "heaptrace")]
        if addr.is_none() {
            self.trace_alloc_failure(Zone::Buffer, flags, caps, bytes);
        }
        into_ptr(addr)
    }

    /// Allocates zeroed bytes from the system arena owned by `core`, for
    /// bring-up of secondary cores by the master. Panics on exhaustion.
    pub fn alloc_zeroed_core_sys(&self, core: u32, bytes: usize) -> NonNull<u8> {
        let mut mm = self.mm.lock();
        let addr = mm.alloc_sys(Flags::empty(), Caps::empty(), core, bytes);
        unsafe { ptr::write_bytes(addr as *mut u8, 0, bytes) };
        mm.commit();
        NonNull::new(addr as *mut u8).unwrap_or_else(|| platform::panic(PanicCode::Mem))
    }

    /// Resets the executing core's system arena.
    ///
    /// Only secondary cores being torn down may do this, and only for the
    /// `System` zone; anything else is a critical flow issue and panics.
    pub fn free_heap(&self, zone: Zone) {
        if platform::cpu_id() == platform::MASTER_CORE || zone != Zone::System {
            trace_mem_error!("free_heap: critical flow issue");
            platform::panic(PanicCode::Mem);
        }
        let mut mm = self.mm.lock();
        let core = platform::cpu_id() as usize;
        let heap = &mut mm.system.as_mut_slice()[core];
        heap.reset();
        heap.commit();
        mm.commit();
    }

    // TODO: wire the PM context to IMR storage once the DMA copy path for
    // context save exists.

    /// Size of the persisted allocator context. Nothing is persisted on
    /// this target.
    pub fn pm_context_size(&self) -> usize {
        0
    }

    /// Saves the in-use memories for a power-management transition.
    pub fn pm_context_save(&self) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    /// Restores the memories saved by [`pm_context_save`](Self::pm_context_save).
    pub fn pm_context_restore(&self) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    /// Locks the map and passes it to `f`, for diagnostics and tests.
    pub fn inspect<R>(&self, f: impl FnOnce(&MemMap) -> R) -> R {
        let mm = self.mm.lock();
        f(&mm)
    }
}

#[cfg(feature = "poison")]
fn write_pattern(heaps: &mut [Heap]) {
    for heap in heaps {
        for map in heap.maps_mut() {
            unsafe { ptr::write_bytes(map.base() as *mut u8, POISON_BYTE, map.span()) };
            map.commit();
        }
        heap.commit();
    }
}

use crate::heap::map::BlockMap;
use crate::heap::Caps;
use crate::platform::{self, PanicCode};
use crate::shared::Coherent;
use crate::trace::trace_mem_error;
use core::cell::UnsafeCell;
use core::ptr;
use core::slice;

/// Usage counters of a heap.
///
/// `used + free` may fall short of the heap size: alignment padding in
/// the bump arena is accounted as used, and block rounding is charged per
/// whole block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeapInfo {
    /// Bytes in use, including alignment padding.
    pub used: usize,
    /// Bytes remaining.
    pub free: usize,
}

/// Static storage for a heap's block map array.
///
/// Declared by the [`mem_map!`](crate::mem_map) macro; all access is
/// serialized by the global allocator lock.
#[repr(transparent)]
pub struct MapStorage<const N: usize>(UnsafeCell<[BlockMap; N]>);

unsafe impl<const N: usize> Sync for MapStorage<N> {}

impl<const N: usize> MapStorage<N> {
    /// Wraps a map array, ordered by ascending block size.
    pub const fn new(maps: [BlockMap; N]) -> Self {
        Self(UnsafeCell::new(maps))
    }

    /// Pointer to the first map.
    pub const fn as_mut_ptr(&self) -> *mut BlockMap {
        self.0.get() as *mut BlockMap
    }
}

/// Alignment must be zero (no requirement) or a power of two; anything
/// else is a static configuration error.
fn check_alignment(alignment: usize) {
    if alignment & alignment.wrapping_sub(1) != 0 {
        platform::panic(PanicCode::Mem);
    }
}

/// A capability-tagged heap over a contiguous memory region.
///
/// A block-mapped heap is exactly partitioned by its maps, ordered by
/// ascending block size. A heap without maps is a bump arena serving the
/// `System` zone: allocations there live as long as the image and there
/// is no free operation.
pub struct Heap {
    base: usize,
    size: usize,
    caps: Caps,
    info: HeapInfo,
    maps: *mut BlockMap,
    maps_len: u32,
}

unsafe impl Send for Heap {}

impl Heap {
    /// Creates a block-mapped heap of `size` bytes at `base` over the map
    /// storage at `maps`.
    ///
    /// Map base addresses are assigned during [`Mm::init`].
    ///
    /// [`Mm::init`]: crate::heap::Mm::init
    pub const fn new(base: usize, size: usize, caps: Caps, maps: *mut BlockMap, maps_len: u32) -> Self {
        Self { base, size, caps, info: HeapInfo { used: 0, free: size }, maps, maps_len }
    }

    /// Creates a bump arena of `size` bytes at `base` for the `System`
    /// zone.
    pub const fn arena(base: usize, size: usize, caps: Caps) -> Self {
        Self { base, size, caps, info: HeapInfo { used: 0, free: size }, maps: ptr::null_mut(), maps_len: 0 }
    }

    /// Base address of the heap region.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the heap region in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capabilities advertised by the heap.
    #[inline]
    pub fn caps(&self) -> Caps {
        self.caps
    }

    /// Usage counters.
    #[inline]
    pub fn info(&self) -> HeapInfo {
        self.info
    }

    /// The block maps, ordered by ascending block size. Empty for a bump
    /// arena.
    pub fn maps(&self) -> &[BlockMap] {
        if self.maps_len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.maps, self.maps_len as usize) }
        }
    }

    pub(crate) fn maps_mut(&mut self) -> &mut [BlockMap] {
        if self.maps_len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.maps, self.maps_len as usize) }
        }
    }

    /// Whether `addr` lies within the heap region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Whether the heap advertises every bit of `caps`.
    #[inline]
    pub fn has_caps(&self, caps: Caps) -> bool {
        self.caps.contains(caps)
    }

    pub(crate) fn reset(&mut self) {
        self.info.used = 0;
        self.info.free = self.size;
    }

    /// Serves a bump allocation, padding the previous watermark to the
    /// data cache alignment.
    pub(crate) fn bump_alloc(&mut self, bytes: usize) -> Option<usize> {
        let mut pad = 0;
        if self.info.used % platform::DCACHE_ALIGN != 0 {
            pad = platform::DCACHE_ALIGN - self.info.used % platform::DCACHE_ALIGN;
        }
        if pad + bytes > self.info.free {
            return None;
        }
        self.info.used += pad;
        let addr = self.base + self.info.used;
        self.info.used += bytes;
        self.info.free -= pad + bytes;
        Some(addr)
    }

    /// Serves `bytes` from the smallest block size that fits.
    ///
    /// If the candidate map's next block base is not already aligned, the
    /// request is conservatively inflated by `alignment` so the shifted
    /// placement still fits the block.
    pub(crate) fn alloc_fit(&mut self, bytes: usize, alignment: usize) -> Option<usize> {
        check_alignment(alignment);
        for i in 0..self.maps_len as usize {
            let (fits, block_size) = {
                let map = &self.maps()[i];
                let raw = map.base() + map.block_size() as usize * map.first_free() as usize;
                let mut need = bytes;
                if alignment != 0 && raw % alignment != 0 {
                    need += alignment;
                }
                (map.block_size() as usize >= need && map.free_count() > 0, map.block_size() as usize)
            };
            if !fits {
                self.maps()[i].commit();
                continue;
            }
            let addr = self.maps_mut()[i].shared().alloc_block(alignment);
            if let Some(addr) = addr {
                self.info.used += block_size;
                self.info.free -= block_size;
                self.commit();
                return Some(addr);
            }
        }
        None
    }

    /// Serves a buffer allocation: the smallest single block that fits,
    /// otherwise a contiguous run in the largest-blocked map whose blocks
    /// are smaller than the request.
    pub(crate) fn alloc_buffer(&mut self, bytes: usize, alignment: usize) -> Option<usize> {
        check_alignment(alignment);
        if let Some(addr) = self.alloc_fit(bytes, alignment) {
            return Some(addr);
        }
        // The request spans blocks: assume the worst case for the
        // alignment shift once across the whole run.
        let bytes = bytes + alignment;
        for i in (0..self.maps_len as usize).rev() {
            let (candidate, block_size) = {
                let map = &self.maps()[i];
                (self.size >= bytes && (map.block_size() as usize) < bytes, map.block_size() as usize)
            };
            if !candidate {
                self.maps()[i].commit();
                continue;
            }
            let run = self.maps_mut()[i].shared().alloc_contiguous(bytes, alignment);
            if let Some((addr, run)) = run {
                let total = run as usize * block_size;
                self.info.used += total;
                self.info.free -= total;
                self.commit();
                return Some(addr);
            }
            self.maps()[i].commit();
        }
        self.commit();
        None
    }

    /// Frees the allocation owning `addr`.
    pub(crate) fn free(&mut self, addr: usize) {
        let Some(index) = self.maps().iter().position(|map| map.contains(addr)) else {
            for map in self.maps() {
                map.commit();
            }
            trace_mem_error!("free: invalid ptr = {:#x}, cpu = {}", addr, platform::cpu_id());
            return;
        };
        let (released, block_size) = {
            let mut map = self.maps_mut()[index].shared();
            let block_size = map.block_size() as usize;
            (map.release(addr), block_size)
        };
        if let Some(run) = released {
            let total = run as usize * block_size;
            self.info.used -= total;
            self.info.free += total;
        }
        self.commit();
    }
}

impl Coherent for Heap {}

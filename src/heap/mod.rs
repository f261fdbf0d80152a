//! Heap allocation.
//!
//! Dynamic memory on the DSP is served from statically configured heaps.
//! A heap covers a contiguous memory region, advertises a capability mask,
//! and is split into *block maps*: arrays of fixed-size blocks, ordered by
//! ascending block size, each with a header per block. The pools
//! configuration is defined at compile time with the
//! [`mem_map!`](crate::mem_map) macro; block sizes are tuned per platform,
//! and a mistuned layout shows up as fragmentation in the
//! [`heap_trace`](Mm::heap_trace) dumps rather than as a failure mode of
//! the allocator itself.
//!
//! Heaps are partitioned into four [`Zone`]s:
//!
//! * [`Zone::System`] — one bump arena per core for boot-time driver
//!   state. Allocation never fails (it panics instead: boot-time code has
//!   no recovery path) and there is no free operation.
//! * [`Zone::SystemRuntime`] — one block-mapped heap per core; a core
//!   must only allocate from its own.
//! * [`Zone::Runtime`] — cross-core block-mapped heaps; selection falls
//!   back to the buffer heaps when no runtime heap covers the requested
//!   capabilities.
//! * [`Zone::Buffer`] — block-mapped heaps for audio data; an allocation
//!   too large for any single block spans a contiguous run of blocks.
//!
//! # Usage
//!
//! Declare the memory map in the platform crate:
//!
//! ```
//! use adsp_mm::heap::Caps;
//!
//! adsp_mm::mem_map! {
//!     /// The platform memory map.
//!     pub static MM;
//!
//!     system {
//!         { base: 0xBE00_0000, size: 0x2000, caps: Caps::RAM.union(Caps::CACHE) },
//!     }
//!     system_runtime {
//!         { base: 0xBE00_2000, size: 0x1000, caps: Caps::RAM.union(Caps::CACHE),
//!           maps: [[64; 32], [256; 8]] },
//!     }
//!     runtime {
//!         { base: 0xBE00_5000, size: 0x1800, caps: Caps::RAM.union(Caps::CACHE),
//!           maps: [[64; 32], [256; 16]] },
//!     }
//!     buffer {
//!         { base: 0xBE01_0000, size: 0x6000, caps: Caps::RAM.union(Caps::DMA),
//!           maps: [[1024; 16], [4096; 2]] },
//!     }
//! }
//! ```
//!
//! Initialize it once at boot, before the first allocation, against the
//! linker-provided system heap base:
//!
//! ```no_run
//! # adsp_mm::mem_map! {
//! #     pub static MM;
//! #     system { { base: 0xBE00_0000, size: 0x2000, caps: adsp_mm::heap::Caps::RAM } }
//! #     system_runtime {}
//! #     runtime {}
//! #     buffer {}
//! # }
//! unsafe { MM.init(0xBE00_0000) };
//! ```

mod heap;
mod macros;
mod map;
mod mm;
mod trace;

pub use self::heap::{Heap, HeapInfo, MapStorage};
pub use self::map::{BlockHeader, BlockHeaders, BlockMap};
pub use self::mm::{HeapArray, HeapStorage, MemMap, Mm, Unsupported};

use bitflags::bitflags;

/// Coarse lifetime category of an allocation request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Zone {
    /// Boot-time state living as long as the image; per-core bump arena.
    System,
    /// Per-core run-time state.
    SystemRuntime,
    /// Cross-core run-time state.
    Runtime,
    /// Audio data, possibly spanning a contiguous block run.
    Buffer,
}

bitflags! {
    /// Memory properties required by a request and advertised by a heap.
    ///
    /// A request is served only from a heap whose capabilities cover every
    /// requested bit.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Caps: u32 {
        /// General-purpose RAM.
        const RAM = 1 << 0;
        /// Low-power memory bank, survives deep sleep.
        const LP = 1 << 1;
        /// High-performance memory bank.
        const HP = 1 << 2;
        /// Visible to the DMA engines.
        const DMA = 1 << 3;
        /// Cached mapping.
        const CACHE = 1 << 4;
        /// Executable.
        const EXEC = 1 << 5;
    }

    /// Allocation request flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Flags: u32 {
        /// Map the allocation for coherent cross-core access.
        const SHARED = 1 << 0;
    }
}

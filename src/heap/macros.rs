/// Declares the static memory map of the image.
///
/// Expands to a `static` [`Mm`](crate::heap::Mm) together with the static
/// storage backing it: a header array per block map, a map array per
/// heap, and a heap array per zone category. Nothing is serialized or
/// parsed at run time; [`Mm::init`](crate::heap::Mm::init) only assigns
/// map base addresses and validates the linker symbol.
///
/// Heaps of the `system` category are bump arenas and take
/// `{ base, size, caps }`; the other categories take an additional
/// `maps: [[BLOCK_SIZE; COUNT], ...]` list, ordered by ascending block
/// size. `system` and `system_runtime` list one heap per core, in core id
/// order. Capability expressions must be const (use
/// [`Caps::union`](crate::heap::Caps::union) rather than `|`).
///
/// # Examples
///
/// ```
/// use adsp_mm::heap::Caps;
///
/// adsp_mm::mem_map! {
///     /// The platform memory map.
///     pub static MM;
///
///     system {
///         { base: 0xBE00_0000, size: 0x2000, caps: Caps::RAM.union(Caps::CACHE) },
///     }
///     system_runtime {
///         { base: 0xBE00_2000, size: 0x1000, caps: Caps::RAM.union(Caps::CACHE),
///           maps: [[64; 32], [256; 8]] },
///     }
///     runtime {
///         { base: 0xBE00_3000, size: 0x1800, caps: Caps::RAM.union(Caps::CACHE),
///           maps: [[64; 32], [256; 16]] },
///     }
///     buffer {
///         { base: 0xBE01_0000, size: 0x6000, caps: Caps::RAM.union(Caps::DMA),
///           maps: [[1024; 16], [4096; 2]] },
///     }
/// }
/// ```
#[macro_export]
macro_rules! mem_map {
    (
        $(#[$attr:meta])* $vis:vis static $name:ident;
        system { $($sys:tt),* $(,)? }
        system_runtime { $($sysrt:tt),* $(,)? }
        runtime { $($rt:tt),* $(,)? }
        buffer { $($buf:tt),* $(,)? }
    ) => {
        $(#[$attr])*
        $vis static $name: $crate::heap::Mm = $crate::heap::Mm::new($crate::heap::MemMap::new(
            $crate::__mm_heaps!(arena: $($sys),*),
            $crate::__mm_heaps!(mapped: $($sysrt),*),
            $crate::__mm_heaps!(mapped: $($rt),*),
            $crate::__mm_heaps!(mapped: $($buf),*),
        ));
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __mm_heaps {
    ($kind:ident:) => {
        $crate::heap::HeapArray::empty()
    };
    ($kind:ident: $($heap:tt),+) => {{
        static HEAPS: $crate::heap::HeapStorage<{ $crate::__mm_count!($($heap)+) }> =
            $crate::heap::HeapStorage::new([$($crate::__mm_heap!($kind: $heap)),+]);
        $crate::heap::HeapArray::new(HEAPS.as_mut_ptr(), $crate::__mm_count!($($heap)+) as u32)
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __mm_heap {
    (arena: { base: $base:expr, size: $size:expr, caps: $caps:expr $(,)? }) => {
        $crate::heap::Heap::arena($base, $size, $caps)
    };
    (mapped: {
        base: $base:expr, size: $size:expr, caps: $caps:expr,
        maps: [$($map:tt),+ $(,)?] $(,)?
    }) => {{
        static MAPS: $crate::heap::MapStorage<{ $crate::__mm_count!($($map)+) }> =
            $crate::heap::MapStorage::new([$($crate::__mm_map!($map)),+]);
        $crate::heap::Heap::new(
            $base,
            $size,
            $caps,
            MAPS.as_mut_ptr(),
            $crate::__mm_count!($($map)+) as u32,
        )
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __mm_map {
    ([$block_size:expr; $count:expr]) => {{
        static BLOCKS: $crate::heap::BlockHeaders<{ $count }> = $crate::heap::BlockHeaders::new();
        $crate::heap::BlockMap::new($block_size as u32, $count as u32, BLOCKS.as_mut_ptr())
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __mm_count {
    ($($item:tt)*) => {
        0_usize $(+ $crate::__mm_one!($item))*
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __mm_one {
    ($item:tt) => {
        1_usize
    };
}

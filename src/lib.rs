//! Memory management core for the *adsp* audio DSP firmware.
//!
//! The DSP has no operating system underneath, so every dynamic memory
//! request in the firmware is served by this crate: a multi-pool,
//! capability-tagged, block-based allocator. The continuous memory of the
//! image is partitioned into heaps of four zones with distinct lifetime
//! rules:
//!
//! * **System** — per-core bump arenas holding boot-time driver state;
//!   never freed.
//! * **SystemRuntime** — per-core block-mapped heaps for run-time state.
//! * **Runtime** — cross-core block-mapped heaps for run-time state.
//! * **Buffer** — block-mapped heaps for audio data, where a single
//!   allocation may span a contiguous run of blocks.
//!
//! A heap is split into one or more *block maps*: arrays of fixed-size
//! blocks with a header per block. Block sizes are tuned per platform at
//! build time, so allocation is a pair of short linear scans rather than a
//! free-list walk. Every heap advertises a capability mask (cacheability,
//! DMA visibility, memory bank class); a request is only served from a
//! heap whose capabilities cover the requested bits.
//!
//! The whole allocator state is serialized by a single interrupt-safe
//! spinlock, so any core and any context (task or interrupt) may call the
//! public entry points. On DSPs without a coherent interconnect, every
//! descriptor update is published to the other cores through the platform
//! [`shared_commit`](platform::shared_commit) hook; see the [`shared`]
//! module.
//!
//! The memory map itself is a static table compiled into the image,
//! declared with the [`mem_map!`](crate::mem_map) macro and validated at
//! boot against the linker-provided heap base symbol by
//! [`Mm::init`](heap::Mm::init).

#![warn(missing_docs)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod heap;
pub mod platform;
pub mod shared;
pub mod sync;

mod trace;

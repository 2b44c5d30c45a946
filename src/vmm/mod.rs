//! Guest memory manager (component H): the free/used VMM-area allocator
//! (`area`) layered over the block-granularity physical allocator (`block`).
//!
//! Grounded on `original_source/kernel/virt/vmm.c` end to end; split into
//! two files the way the original's single translation unit separates by
//! concern (`vmm_area`/`mm_struct` bookkeeping vs. `block_section`/
//! `mem_block` physical accounting) even though both lived in one `vmm.c`.

pub mod area;
pub mod block;

pub use area::{AreaFlags, AreaHandle, MapType, MmStruct};

//! 2MiB-block bump allocator backing `VM_MAP_BK`-style guest memory (component H).
//!
//! Grounded on `original_source/kernel/virt/vmm.c` lines 837-980
//! (`__vmm_free_memblock`/`get_memblock_from_section`/`vmm_alloc_memblock`/
//! `vmm_init`): a linked list of `block_section`s, each a bitmap of fixed-size
//! blocks, searched starting from `current_index` for the next free bit. This
//! crate has no heap-backed linked list of sections, so sections live in a
//! fixed `[BlockSection; MAX_BLOCK_SECTIONS]` array and each section's bitmap
//! is a fixed `[u64; BITMAP_WORDS]` sized for the largest region this
//! platform is expected to hand the VMM (see `MAX_BLOCKS_PER_SECTION`).

use crate::error::{HvError, HvResult};
use crate::sync::SpinLock;

pub const MEM_BLOCK_SHIFT: u32 = 21; // 2 MiB
pub const MEM_BLOCK_SIZE: u64 = 1 << MEM_BLOCK_SHIFT;

const MAX_BLOCK_SECTIONS: usize = 8;
/// Largest number of blocks a single section's fixed bitmap can track
/// (4096 blocks * 2MiB = 8GiB per region).
const MAX_BLOCKS_PER_SECTION: usize = 4096;
const BITMAP_WORDS: usize = MAX_BLOCKS_PER_SECTION / 64;

struct BlockSection {
    start: u64, // block-aligned physical base
    total_blocks: usize,
    free_blocks: usize,
    current_index: usize,
    bitmap: [u64; BITMAP_WORDS],
    in_use: bool,
}

impl BlockSection {
    const fn empty() -> Self {
        Self {
            start: 0,
            total_blocks: 0,
            free_blocks: 0,
            current_index: 0,
            bitmap: [0; BITMAP_WORDS],
            in_use: false,
        }
    }

    fn test_bit(&self, id: usize) -> bool {
        self.bitmap[id / 64] & (1 << (id % 64)) != 0
    }

    fn set_bit(&mut self, id: usize) {
        self.bitmap[id / 64] |= 1 << (id % 64);
    }

    fn clear_bit(&mut self, id: usize) {
        self.bitmap[id / 64] &= !(1 << (id % 64));
    }

    /// `find_next_zero_bit_loop`: search from `current_index`, wrapping once.
    fn find_next_zero_bit_loop(&self) -> Option<usize> {
        for id in self.current_index..self.total_blocks {
            if !self.test_bit(id) {
                return Some(id);
            }
        }
        for id in 0..self.current_index {
            if !self.test_bit(id) {
                return Some(id);
            }
        }
        None
    }
}

struct BlockAllocator {
    sections: [BlockSection; MAX_BLOCK_SECTIONS],
    free_blocks: usize,
}

impl BlockAllocator {
    const fn new() -> Self {
        Self {
            sections: [const { BlockSection::empty() }; MAX_BLOCK_SECTIONS],
            free_blocks: 0,
        }
    }
}

static ALLOCATOR: SpinLock<BlockAllocator> = SpinLock::new(BlockAllocator::new());

/// `vmm_init`'s per-region section setup: register a block-aligned
/// `[start, end)` range (caller has already block-aligned it per the
/// original's `BALIGN(region->phy_base, BLOCK_SIZE)`/`ALIGN(..., BLOCK_SIZE)`).
pub fn add_block_section(start: u64, end: u64) -> HvResult<()> {
    if end <= start {
        return Ok(()); // dropped, mirroring vmm_init's "drop unused" branch
    }
    let total_blocks = ((end - start) >> MEM_BLOCK_SHIFT) as usize;
    if total_blocks > MAX_BLOCKS_PER_SECTION {
        return Err(HvError::InvalidArgument);
    }

    let mut a = ALLOCATOR.lock();
    let idx = a
        .sections
        .iter()
        .position(|s| !s.in_use)
        .ok_or(HvError::NoMemory)?;
    a.sections[idx] = BlockSection {
        start,
        total_blocks,
        free_blocks: total_blocks,
        current_index: 0,
        bitmap: [0; BITMAP_WORDS],
        in_use: true,
    };
    a.free_blocks += total_blocks;
    Ok(())
}

/// `vmm_has_enough_memory`.
pub fn has_enough_memory(size: u64) -> bool {
    (size >> MEM_BLOCK_SHIFT) as usize <= ALLOCATOR.lock().free_blocks
}

/// `vmm_alloc_memblock`: returns the block frame number (`bfn`), a
/// `MEM_BLOCK_SIZE`-granularity index into physical memory
/// (`phy_base = bfn << MEM_BLOCK_SHIFT`). The original's heap-allocated
/// `struct mem_block` wrapper is dropped; callers needing a chain of blocks
/// (`vmm_area::b_head`) link bfns through their own fixed-size array instead.
pub fn alloc_memblock() -> HvResult<u32> {
    let mut a = ALLOCATOR.lock();
    for s in a.sections.iter_mut().filter(|s| s.in_use && s.free_blocks != 0) {
        if let Some(id) = s.find_next_zero_bit_loop() {
            s.set_bit(id);
            s.current_index = id + 1;
            s.free_blocks -= 1;
            let bfn = ((s.start >> MEM_BLOCK_SHIFT) as u32) + id as u32;
            a.free_blocks -= 1;
            return Ok(bfn);
        }
    }
    Err(HvError::NoMemory)
}

/// `__vmm_free_memblock`.
pub fn free_memblock(bfn: u32) -> HvResult<()> {
    let base = (bfn as u64) << MEM_BLOCK_SHIFT;
    let mut a = ALLOCATOR.lock();
    for s in a.sections.iter_mut().filter(|s| s.in_use) {
        let end = s.start + ((s.total_blocks as u64) << MEM_BLOCK_SHIFT);
        if base >= s.start && base < end {
            let id = ((base - s.start) >> MEM_BLOCK_SHIFT) as usize;
            s.clear_bit(id);
            s.free_blocks += 1;
            a.free_blocks += 1;
            return Ok(());
        }
    }
    Err(HvError::InvalidArgument)
}

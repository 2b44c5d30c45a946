//! Guest-memory area allocator: free/used interval lists over a VM's IPA
//! space (component H).
//!
//! Grounded on `original_source/kernel/virt/vmm.c`: `__add_free_vmm_area`'s
//! merge-with-neighbour-then-size-ordered-insert, `__split_vmm_area`'s
//! left/right remainder carve-out, `alloc_free_vmm_area`/`split_vmm_area`/
//! `request_vmm_area`, and `map_vmm_area`'s PT/BK/linear dispatch. The
//! original threads `struct vmm_area` through two `list_head`s allocated from
//! a general-purpose heap; this crate has no guest-memory heap, so both free
//! and used areas live in one fixed `[VmmArea; MAX_VMM_AREAS]` pool with two
//! intrusive next-index chains (`free_next`/`used_next`), the same idiom
//! `event.rs`'s `WaitList` and `vgic.rs`'s pending/active lists use.
//!
//! `arch_guest_map`/`arch_guest_unmap` are architecture seams the original
//! calls directly; this crate has no `Stage2Mapper` instance reachable from
//! here (that lives on `Vm`, a layer above), so actually touching the stage-2
//! page tables is left to a registered hook, the same `register_hooks`
//! pattern `vtimer.rs` uses to call back into `vcpu.rs`.

use crate::error::{HvError, HvResult};
use crate::flags::bitflags_like;
use crate::sync::SpinLock;
use crate::vmm::block::{self, MEM_BLOCK_SIZE};

pub const MAX_VMM_AREAS: usize = 64;
/// Cap on the number of 2MiB blocks a single BK-mapped area can hold
/// (256 blocks = 512MiB), since `VmmArea::blocks` is a fixed array rather
/// than the original's heap-allocated `mem_block` chain.
pub const MAX_BLOCKS_PER_AREA: usize = 256;

const PAGE_SIZE: u64 = 4096;
const PAGE_MASK: u64 = PAGE_SIZE - 1;
pub const BLOCK_MASK: u64 = MEM_BLOCK_SIZE - 1;

bitflags_like! {
    pub struct AreaFlags: u32 {
        const RW           = 1 << 0;
        const RO           = 1 << 1;
        const SHARED       = 1 << 2;
        const SHMEM        = 1 << 3;
        const GUEST_SHMEM  = 1 << 4;
        const HUGE         = 1 << 5;
        const GUEST        = 1 << 6;
        const IO           = 1 << 7;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapType {
    /// `VM_MAP_PT`: identity-style mapping, `pstart == start`.
    Pt,
    /// `VM_MAP_BK`: backed by a chain of `vmm::block` 2MiB blocks.
    Bk,
    /// Anything else: a single linear run starting at a caller-supplied
    /// physical base.
    Linear,
}

#[derive(Clone, Copy)]
struct VmmArea {
    start: u64,
    end: u64,
    pstart: Option<u64>,
    flags: AreaFlags,
    map_type: MapType,
    vmid: usize,
    blocks: [u32; MAX_BLOCKS_PER_AREA],
    block_count: usize,
    in_use: bool, // slot occupied (on either list)
}

impl VmmArea {
    const fn empty() -> Self {
        Self {
            start: 0,
            end: 0,
            pstart: None,
            flags: AreaFlags::empty(),
            map_type: MapType::Linear,
            vmid: 0,
            blocks: [0; MAX_BLOCKS_PER_AREA],
            block_count: 0,
            in_use: false,
        }
    }

    fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// A handle into the area pool; stable for the lifetime of the area.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AreaHandle(u16);

pub struct MmStruct {
    areas: [VmmArea; MAX_VMM_AREAS],
    free_next: [Option<u16>; MAX_VMM_AREAS],
    used_next: [Option<u16>; MAX_VMM_AREAS],
    free_head: Option<u16>,
    used_head: Option<u16>,
}

impl MmStruct {
    pub const fn new() -> Self {
        Self {
            areas: [const { VmmArea::empty() }; MAX_VMM_AREAS],
            free_next: [None; MAX_VMM_AREAS],
            used_next: [None; MAX_VMM_AREAS],
            free_head: None,
            used_head: None,
        }
    }

    /// Seed the whole IPA range `[base, base+size)` as one free area.
    pub fn init(&mut self, base: u64, size: u64) -> HvResult<()> {
        let idx = self.alloc_slot()?;
        self.areas[idx] = VmmArea {
            start: base,
            end: base + size,
            pstart: None,
            flags: AreaFlags::empty(),
            map_type: MapType::Linear,
            vmid: 0,
            blocks: [0; MAX_BLOCKS_PER_AREA],
            block_count: 0,
            in_use: true,
        };
        self.push_free(idx as u16);
        Ok(())
    }

    fn alloc_slot(&self) -> HvResult<usize> {
        self.areas
            .iter()
            .position(|a| !a.in_use)
            .ok_or(HvError::NoMemory)
    }

    fn push_free(&mut self, idx: u16) {
        self.free_next[idx as usize] = self.free_head;
        self.free_head = Some(idx);
    }

    fn push_used(&mut self, idx: u16) {
        self.used_next[idx as usize] = self.used_head;
        self.used_head = Some(idx);
    }

    fn remove_free(&mut self, idx: u16) {
        remove_from_chain(&mut self.free_head, &mut self.free_next, idx);
    }

    fn remove_used(&mut self, idx: u16) {
        remove_from_chain(&mut self.used_head, &mut self.used_next, idx);
    }

    fn free_iter(&self) -> impl Iterator<Item = u16> + '_ {
        core::iter::successors(self.free_head, move |&i| self.free_next[i as usize])
    }

    /// `__split_vmm_area`: carve `[base, end)` out of the free area at `idx`,
    /// re-inserting whatever's left on either side back onto the free list,
    /// and moving the carved area onto the used list.
    fn split_at(&mut self, idx: u16, base: u64, end: u64, flags: AreaFlags) -> HvResult<u16> {
        let (start, old_end) = (self.areas[idx as usize].start, self.areas[idx as usize].end);
        let left_size = base - start;
        let right_size = old_end - end;

        self.remove_free(idx);

        if left_size > 0 {
            let lidx = self.alloc_slot()?;
            self.areas[lidx] = VmmArea { start, end: base, ..VmmArea::empty() };
            self.areas[lidx].in_use = true;
            self.push_free(lidx as u16);
        }
        if right_size > 0 {
            let ridx = self.alloc_slot()?;
            self.areas[ridx] = VmmArea { start: end, end: old_end, ..VmmArea::empty() };
            self.areas[ridx].in_use = true;
            self.push_free(ridx as u16);
        }

        let a = &mut self.areas[idx as usize];
        a.start = base;
        a.end = end;
        a.flags = flags;
        a.map_type = MapType::Linear;
        a.vmid = 0;
        a.pstart = None;
        a.block_count = 0;
        self.push_used(idx);
        Ok(idx)
    }

    /// `alloc_free_vmm_area`: first-fit over the free list, aligned to `mask`
    /// (either `PAGE_MASK` or `BLOCK_MASK`).
    pub fn alloc_free_vmm_area(&mut self, size: u64, mask: u64, flags: AreaFlags) -> HvResult<AreaHandle> {
        let size = (size + PAGE_MASK) & !PAGE_MASK;
        for fidx in self.free_iter() {
            let a = &self.areas[fidx as usize];
            let base = (a.start + mask) & !mask;
            let end = base + size;
            if base >= a.start && end <= a.end {
                let idx = self.split_at(fidx, base, end, flags)?;
                return Ok(AreaHandle(idx));
            }
        }
        Err(HvError::NoMemory)
    }

    /// `split_vmm_area`: carve an exact `[base, base+size)` range that must
    /// be fully contained in one existing free area.
    pub fn split_vmm_area(&mut self, base: u64, size: u64, flags: AreaFlags) -> HvResult<AreaHandle> {
        let end = base + size;
        for fidx in self.free_iter() {
            let a = &self.areas[fidx as usize];
            if base >= a.start && end <= a.end {
                let idx = self.split_at(fidx, base, end, flags)?;
                return Ok(AreaHandle(idx));
            }
        }
        Err(HvError::NotFound)
    }

    /// `request_vmm_area`: split, then pin a physical base onto the result.
    pub fn request_vmm_area(&mut self, base: u64, pbase: u64, size: u64, flags: AreaFlags) -> HvResult<AreaHandle> {
        let h = self.split_vmm_area(base, size, flags)?;
        self.areas[h.0 as usize].pstart = Some(pbase);
        Ok(h)
    }

    /// `map_vmm_area`: resolve `pstart`/the block chain per map type. Actual
    /// stage-2 page-table installation happens through the registered
    /// `InstallMappingFn` hook, mirroring `__create_guest_mapping`'s
    /// `arch_guest_map` call, which this module has no direct access to.
    pub fn map_vmm_area(&mut self, h: AreaHandle, map_type: MapType, pbase: Option<u64>) -> HvResult<()> {
        let idx = h.0 as usize;
        self.areas[idx].map_type = map_type;
        match map_type {
            MapType::Pt => {
                let start = self.areas[idx].start;
                self.areas[idx].pstart = Some(start);
                install_mapping(self.areas[idx].start, start, self.areas[idx].size(), self.areas[idx].flags);
            }
            MapType::Bk => {
                let mut base = self.areas[idx].start;
                let mut remaining = self.areas[idx].size();
                while remaining > 0 {
                    let bfn = block::alloc_memblock()?;
                    let n = self.areas[idx].block_count;
                    if n >= MAX_BLOCKS_PER_AREA {
                        return Err(HvError::NoMemory);
                    }
                    self.areas[idx].blocks[n] = bfn;
                    self.areas[idx].block_count += 1;
                    let phy = (bfn as u64) << block::MEM_BLOCK_SHIFT;
                    install_mapping(base, phy, MEM_BLOCK_SIZE, self.areas[idx].flags.union(AreaFlags::HUGE).union(AreaFlags::GUEST));
                    base += MEM_BLOCK_SIZE;
                    remaining -= MEM_BLOCK_SIZE;
                }
            }
            MapType::Linear => {
                let pbase = pbase.ok_or(HvError::InvalidArgument)?;
                self.areas[idx].pstart = Some(pbase);
                install_mapping(self.areas[idx].start, pbase, self.areas[idx].size(), self.areas[idx].flags);
            }
        }
        Ok(())
    }

    /// `release_vmm_area`: give back any BK blocks, unmap, then return the
    /// slot to the free list, merging with an address-adjacent free
    /// neighbour exactly the way `__add_free_vmm_area` does (no size-ordered
    /// insert — this crate's free list is unordered and scanned first-fit).
    pub fn release_vmm_area(&mut self, h: AreaHandle) -> HvResult<()> {
        let idx = h.0 as usize;
        if !self.areas[idx].flags.contains(AreaFlags::SHARED) && self.areas[idx].map_type == MapType::Bk {
            for i in 0..self.areas[idx].block_count {
                let bfn = self.areas[idx].blocks[i];
                block::free_memblock(bfn)?;
            }
        }
        self.remove_used(idx as u16);

        let (mut start, mut end) = (self.areas[idx].start, self.areas[idx].end);
        self.areas[idx] = VmmArea::empty();

        // Re-scan and absorb adjacent free areas on either side until a full
        // pass finds none left, mirroring `__add_free_vmm_area`'s `repeat:`
        // label — a single first-match merge would leave two adjacent free
        // areas sharing an endpoint when both neighbours are free.
        loop {
            let mut merged = None;
            for fidx in self.free_iter() {
                let a = &self.areas[fidx as usize];
                if a.end == start || a.start == end {
                    merged = Some(fidx);
                    break;
                }
            }
            match merged {
                Some(fidx) => {
                    let a = &self.areas[fidx as usize];
                    start = core::cmp::min(start, a.start);
                    end = core::cmp::max(end, a.end);
                    self.remove_free(fidx);
                    self.areas[fidx as usize] = VmmArea::empty();
                }
                None => break,
            }
        }

        self.areas[idx] = VmmArea { start, end, ..VmmArea::empty() };
        self.areas[idx].in_use = true;
        self.push_free(idx as u16);
        Ok(())
    }

    pub fn area_start(&self, h: AreaHandle) -> u64 {
        self.areas[h.0 as usize].start
    }

    pub fn area_end(&self, h: AreaHandle) -> u64 {
        self.areas[h.0 as usize].end
    }

    pub fn area_pstart(&self, h: AreaHandle) -> Option<u64> {
        self.areas[h.0 as usize].pstart
    }

    pub fn set_vmid(&mut self, h: AreaHandle, vmid: usize) {
        self.areas[h.0 as usize].vmid = vmid;
    }

    pub fn used_count(&self) -> usize {
        core::iter::successors(self.used_head, move |&i| self.used_next[i as usize]).count()
    }
}

impl Default for MmStruct {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_from_chain(head: &mut Option<u16>, next: &mut [Option<u16>; MAX_VMM_AREAS], idx: u16) {
    if *head == Some(idx) {
        *head = next[idx as usize].take();
        return;
    }
    let mut cur = *head;
    while let Some(c) = cur {
        if next[c as usize] == Some(idx) {
            next[c as usize] = next[idx as usize].take();
            return;
        }
        cur = next[c as usize];
    }
}

pub type InstallMappingFn = fn(vir: u64, phy: u64, size: u64, flags: AreaFlags);
static INSTALL_MAPPING: SpinLock<Option<InstallMappingFn>> = SpinLock::new(None);

/// Register the stage-2 installer, mirroring `vtimer::register_hooks`.
pub fn register_install_hook(f: InstallMappingFn) {
    *INSTALL_MAPPING.lock() = Some(f);
}

fn install_mapping(vir: u64, phy: u64, size: u64, flags: AreaFlags) {
    if let Some(f) = *INSTALL_MAPPING.lock() {
        f(vir, phy, size, flags);
    }
}

/// `create_hvm_shmem_map`: carve a shared-memory window for `vmid` out of
/// the host VM's (`vm0`'s) address space and map it onto `phy`.
pub fn create_hvm_shmem_map(vm0: &mut MmStruct, phy: u64, size: u64, vmid: usize) -> HvResult<u64> {
    let h = vm0.alloc_free_vmm_area(
        size,
        PAGE_MASK,
        AreaFlags::GUEST_SHMEM.union(AreaFlags::SHARED).union(AreaFlags::RW),
    )?;
    vm0.set_vmid(h, vmid);
    vm0.map_vmm_area(h, MapType::Linear, Some(phy))?;
    Ok(vm0.area_start(h))
}

/// `copy_from_guest`: page-at-a-time copy out of guest physical memory.
/// `translate` stands in for the original's `guest_va_to_pa` + host
/// page-table dance (`create_host_mapping`/`vtop`/`destroy_host_mapping`):
/// since the guest's physical memory backs directly onto host physical
/// memory here (no second translation layer to map through), this crate
/// only needs the guest-VA-to-host-PA function, then reads straight through
/// the host's identity map.
///
/// # Safety
/// `translate(va)` must return a physical address that is safely readable
/// for at least a page; `target` must have room for `size` bytes.
pub unsafe fn copy_from_guest(target: *mut u8, src: u64, size: usize, translate: impl Fn(u64) -> Option<u64>) -> HvResult<()> {
    let mut start = src;
    let mut left = size;
    let mut out = target;
    while left > 0 {
        let page_end = (start & !PAGE_MASK) + PAGE_SIZE;
        let mut copy_size = (page_end - start) as usize;
        if copy_size > left {
            copy_size = left;
        }
        let pa = translate(start).ok_or(HvError::Fault)?;
        unsafe {
            core::ptr::copy_nonoverlapping(pa as *const u8, out, copy_size);
            out = out.add(copy_size);
        }
        start += copy_size as u64;
        left -= copy_size;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_release_restores_single_free_area() {
        let mut mm = MmStruct::new();
        mm.init(0x4000_0000, 0x1000_0000).unwrap();
        let h = mm.alloc_free_vmm_area(0x1000, PAGE_MASK, AreaFlags::RW).unwrap();
        assert_eq!(mm.used_count(), 1);
        mm.release_vmm_area(h).unwrap();
        assert_eq!(mm.used_count(), 0);
        assert_eq!(mm.free_iter().count(), 1);
    }

    #[test]
    fn split_exact_range_moves_area_to_used_list() {
        let mut mm = MmStruct::new();
        mm.init(0x8000_0000, 0x1000).unwrap();
        let h = mm.split_vmm_area(0x8000_0000, 0x1000, AreaFlags::RW).unwrap();
        assert_eq!(mm.area_start(h), 0x8000_0000);
        assert_eq!(mm.used_count(), 1);
        assert_eq!(mm.free_iter().count(), 0);
    }

    #[test]
    fn alloc_too_large_fails() {
        let mut mm = MmStruct::new();
        mm.init(0x9000_0000, 0x1000).unwrap();
        assert!(mm.alloc_free_vmm_area(0x2000, PAGE_MASK, AreaFlags::RW).is_err());
    }

    #[test]
    fn request_vmm_area_pins_physical_base() {
        let mut mm = MmStruct::new();
        mm.init(0xa000_0000, 0x2000).unwrap();
        let h = mm.request_vmm_area(0xa000_0000, 0x5000_0000, 0x1000, AreaFlags::RW).unwrap();
        assert_eq!(mm.area_pstart(h), Some(0x5000_0000));
    }

    #[test]
    fn release_merges_free_neighbours_on_both_sides() {
        let mut mm = MmStruct::new();
        mm.init(0xb000_0000, 0x3000).unwrap();
        let left = mm.split_vmm_area(0xb000_0000, 0x1000, AreaFlags::RW).unwrap();
        let mid = mm.split_vmm_area(0xb000_1000, 0x1000, AreaFlags::RW).unwrap();
        let right = mm.split_vmm_area(0xb000_2000, 0x1000, AreaFlags::RW).unwrap();
        assert_eq!(mm.free_iter().count(), 0);

        mm.release_vmm_area(left).unwrap();
        mm.release_vmm_area(right).unwrap();
        assert_eq!(mm.free_iter().count(), 2);

        mm.release_vmm_area(mid).unwrap();
        assert_eq!(mm.used_count(), 0);
        assert_eq!(mm.free_iter().count(), 1);
        let only_free = mm.free_iter().next().unwrap();
        assert_eq!(mm.area_start(AreaHandle(only_free)), 0xb000_0000);
        assert_eq!(mm.area_end(AreaHandle(only_free)), 0xb000_3000);
    }
}

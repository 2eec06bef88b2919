//! Per-process AArch64 address spaces (spec §4.7): 4-level, 4 KiB-granule
//! page tables (L0 bits 47:39, L1 38:30, L2 29:21, L3 20:12), an ASID
//! allocator, and the copy-on-write fork path.
//!
//! Table pages are ordinary PMM frames, walked through
//! `mmu::phys_to_virt` the same way the static kernel tables in `mmu.rs`
//! are built — the difference is these are allocated per process instead
//! of living in `.bss`.

use spinning_top::Spinlock;

use crate::config::MAX_ASID;
use crate::mm::cow::COW_TABLE;
use crate::mm::pmm::{self, PhysFrame};
use crate::mmu::{self, flags, phys_to_virt, ENTRIES_PER_TABLE, PTE_ADDR_MASK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    OutOfMemory,
    NotMapped,
    AlreadyMapped,
    AsidExhausted,
}

fn l0_index(va: usize) -> usize {
    (va >> 39) & 0x1FF
}
fn l1_index(va: usize) -> usize {
    (va >> 30) & 0x1FF
}
fn l2_index(va: usize) -> usize {
    (va >> 21) & 0x1FF
}
fn l3_index(va: usize) -> usize {
    (va >> 12) & 0x1FF
}

fn entry_ptr(table_phys: usize, idx: usize) -> *mut u64 {
    unsafe { (phys_to_virt(table_phys) as *mut u64).add(idx) }
}

/// Read a page table entry. Public so the fault handler and `errors.rs`'s
/// validation path can inspect mappings without going through `translate`.
pub fn read_pte(table_phys: usize, idx: usize) -> u64 {
    unsafe { *entry_ptr(table_phys, idx) }
}

pub fn write_pte(table_phys: usize, idx: usize, value: u64) {
    unsafe { *entry_ptr(table_phys, idx) = value };
}

fn alloc_table() -> Result<usize, VmmError> {
    let frame = pmm::alloc_page_zeroed().ok_or(VmmError::OutOfMemory)?;
    Ok(frame.start_address())
}

/// Walk to (creating if absent) the next-level table referenced by
/// `table_phys[idx]`.
fn next_level(table_phys: usize, idx: usize) -> Result<usize, VmmError> {
    let entry = read_pte(table_phys, idx);
    if entry & flags::VALID != 0 {
        return Ok((entry & PTE_ADDR_MASK) as usize);
    }
    let child = alloc_table()?;
    write_pte(table_phys, idx, (child as u64) | flags::VALID | flags::TABLE);
    Ok(child)
}

/// Walk to the next-level table, returning `None` if any level along the
/// path is not present (used by read-only walks like `translate`).
fn next_level_existing(table_phys: usize, idx: usize) -> Option<usize> {
    let entry = read_pte(table_phys, idx);
    if entry & flags::VALID == 0 {
        return None;
    }
    Some((entry & PTE_ADDR_MASK) as usize)
}

/// ASID 0 is reserved for the kernel; processes draw from 1..MAX_ASID.
struct AsidAllocator {
    used: [bool; MAX_ASID as usize],
}

impl AsidAllocator {
    const fn new() -> Self {
        Self {
            used: [false; MAX_ASID as usize],
        }
    }

    fn alloc(&mut self) -> Result<u16, VmmError> {
        for asid in 1..MAX_ASID as usize {
            if !self.used[asid] {
                self.used[asid] = true;
                return Ok(asid as u16);
            }
        }
        Err(VmmError::AsidExhausted)
    }

    fn free(&mut self, asid: u16) {
        if asid != 0 && (asid as usize) < self.used.len() {
            self.used[asid as usize] = false;
        }
    }
}

static ASID_ALLOC: Spinlock<AsidAllocator> = Spinlock::new(AsidAllocator::new());

/// A process's user-space address space: one root (L0) table and the ASID
/// that tags its TLB entries.
pub struct AddressSpace {
    l0_phys: usize,
    asid: u16,
}

impl AddressSpace {
    pub fn new() -> Result<Self, VmmError> {
        let l0_phys = alloc_table()?;
        let asid = ASID_ALLOC.lock().alloc()?;
        Ok(Self { l0_phys, asid })
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    pub fn table_phys(&self) -> usize {
        self.l0_phys
    }

    fn walk_create(&self, va: usize) -> Result<(usize, usize), VmmError> {
        let l1 = next_level(self.l0_phys, l0_index(va))?;
        let l2 = next_level(l1, l1_index(va))?;
        let l3 = next_level(l2, l2_index(va))?;
        Ok((l3, l3_index(va)))
    }

    fn walk_existing(&self, va: usize) -> Option<(usize, usize)> {
        let l1 = next_level_existing(self.l0_phys, l0_index(va))?;
        let l2 = next_level_existing(l1, l1_index(va))?;
        let l3 = next_level_existing(l2, l2_index(va))?;
        Some((l3, l3_index(va)))
    }

    /// Map `pa` at `va` with the given leaf flags (AP/PXN/UXN/etc, minus
    /// VALID/TABLE/AF/attr-index which this fills in).
    pub fn map(&mut self, va: usize, pa: usize, leaf_flags: u64) -> Result<(), VmmError> {
        let (l3, idx) = self.walk_create(va)?;
        if read_pte(l3, idx) & flags::VALID != 0 {
            return Err(VmmError::AlreadyMapped);
        }
        let entry = (pa as u64 & PTE_ADDR_MASK)
            | flags::VALID
            | flags::TABLE
            | flags::AF
            | flags::NG
            | mmu::attr_index(crate::mmu::MAIR_NORMAL_WB)
            | leaf_flags;
        write_pte(l3, idx, entry);
        Ok(())
    }

    /// Allocate a zeroed physical page and map it at `va`. Registers the
    /// frame with the COW table at refcount 1.
    pub fn alloc_map(&mut self, va: usize, leaf_flags: u64) -> Result<usize, VmmError> {
        let frame = pmm::alloc_page_zeroed().ok_or(VmmError::OutOfMemory)?;
        let pa = frame.start_address();
        self.map(va, pa, leaf_flags)?;
        COW_TABLE.inc_ref(pa);
        Ok(pa)
    }

    /// Unmap `va`, returning the physical address that was mapped there.
    pub fn unmap(&mut self, va: usize) -> Result<usize, VmmError> {
        let (l3, idx) = self.walk_existing(va).ok_or(VmmError::NotMapped)?;
        let entry = read_pte(l3, idx);
        if entry & flags::VALID == 0 {
            return Err(VmmError::NotMapped);
        }
        write_pte(l3, idx, 0);
        mmu::flush_tlb_page(va);
        Ok((entry & PTE_ADDR_MASK) as usize)
    }

    pub fn translate(&self, va: usize) -> Option<usize> {
        let (l3, idx) = self.walk_existing(va)?;
        let entry = read_pte(l3, idx);
        if entry & flags::VALID == 0 {
            return None;
        }
        Some((entry & PTE_ADDR_MASK) as usize | (va & (crate::config::PAGE_SIZE - 1)))
    }

    /// Clone every present mapping from `other` into `self`, marking both
    /// sides' leaf entries read-only and COW, and bumping the shared
    /// frame's refcount (spec §4.7's fork path). Table structure is NOT
    /// shared — only leaf (page) frames are.
    pub fn clone_cow_from(&mut self, other: &mut AddressSpace, va_ranges: &[(usize, usize)]) -> Result<(), VmmError> {
        for &(start, end) in va_ranges {
            let mut va = start;
            while va < end {
                if let Some((l3, idx)) = other.walk_existing(va) {
                    let entry = read_pte(l3, idx);
                    if entry & flags::VALID != 0 {
                        let pa = (entry & PTE_ADDR_MASK) as usize;
                        let ro_entry = (entry & !flags::AP_RW_ALL) | flags::AP_RO_ALL;
                        write_pte(l3, idx, ro_entry);
                        mmu::flush_tlb_page(va);

                        let (child_l3, child_idx) = self.walk_create(va)?;
                        write_pte(child_l3, child_idx, ro_entry);

                        COW_TABLE.inc_ref(pa);
                        COW_TABLE.mark_cow(pa);
                    }
                }
                va += crate::config::PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Clear the COW/read-only state on a private page after the copy
    /// fault handler has given the faulting process its own copy.
    pub fn make_cow_readonly(&mut self, va: usize) -> Result<(), VmmError> {
        let (l3, idx) = self.walk_existing(va).ok_or(VmmError::NotMapped)?;
        let entry = read_pte(l3, idx);
        let ro_entry = (entry & !flags::AP_RW_ALL) | flags::AP_RO_ALL;
        write_pte(l3, idx, ro_entry);
        mmu::flush_tlb_page(va);
        Ok(())
    }

    /// Replace the mapping at `va` with a freshly copied private frame,
    /// restoring write access and clearing COW once the refcount drops to
    /// the point where the page is no longer shared.
    pub fn install_private_copy(&mut self, va: usize, new_pa: usize) -> Result<(), VmmError> {
        let (l3, idx) = self.walk_existing(va).ok_or(VmmError::NotMapped)?;
        let entry = read_pte(l3, idx);
        let rw_entry = (entry & !PTE_ADDR_MASK & !flags::AP_RW_ALL & !flags::AP_RO_ALL)
            | (new_pa as u64 & PTE_ADDR_MASK)
            | flags::AP_RW_ALL;
        write_pte(l3, idx, rw_entry);
        mmu::flush_tlb_page(va);
        COW_TABLE.inc_ref(new_pa);
        Ok(())
    }

    /// Tear down every mapped leaf and its page tables, releasing frames
    /// to the PMM (or decrementing the COW refcount for shared pages) and
    /// the ASID to the allocator.
    pub fn destroy(&mut self) {
        unsafe {
            self.destroy_level(self.l0_phys, 0);
        }
        pmm::free_page(PhysFrame::new(self.l0_phys));
        ASID_ALLOC.lock().free(self.asid);
    }

    unsafe fn destroy_level(&self, table_phys: usize, level: u8) {
        for idx in 0..ENTRIES_PER_TABLE {
            let entry = read_pte(table_phys, idx);
            if entry & flags::VALID == 0 {
                continue;
            }
            let child = (entry & PTE_ADDR_MASK) as usize;
            if level < 3 {
                unsafe {
                    self.destroy_level(child, level + 1);
                }
                pmm::free_page(PhysFrame::new(child));
            } else if COW_TABLE.get_ref(child) == 0 {
                // Untracked: this frame was never registered with the COW
                // table (e.g. mapped directly by the loader rather than
                // through `alloc_map`), so it's exclusively owned by this
                // address space and must always be returned.
                pmm::free_page(PhysFrame::new(child));
            } else if COW_TABLE.dec_ref(child) {
                pmm::free_page(PhysFrame::new(child));
            }
        }
    }
}

unsafe impl Send for AddressSpace {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_decomposition_covers_48_bit_va() {
        let va = 0x0000_ABCD_1234_5000usize;
        assert_eq!(l0_index(va), (va >> 39) & 0x1FF);
        assert_eq!(l1_index(va), (va >> 30) & 0x1FF);
        assert_eq!(l2_index(va), (va >> 21) & 0x1FF);
        assert_eq!(l3_index(va), (va >> 12) & 0x1FF);
    }

    #[test]
    fn map_translate_unmap_roundtrip() {
        let mut asp = AddressSpace::new().expect("address space");
        let va = crate::config::USER_CODE_BASE;
        let pa = asp
            .alloc_map(va, flags::AP_RW_ALL | flags::UXN)
            .expect("alloc_map");
        assert_eq!(asp.translate(va), Some(pa));
        assert_eq!(asp.unmap(va).unwrap(), pa);
        assert_eq!(asp.translate(va), None);
        asp.destroy();
    }

    #[test]
    fn asid_allocator_excludes_zero_and_reuses_freed() {
        let mut alloc = AsidAllocator::new();
        let a = alloc.alloc().unwrap();
        assert_ne!(a, 0);
        alloc.free(a);
        let b = alloc.alloc().unwrap();
        assert_eq!(a, b);
    }
}

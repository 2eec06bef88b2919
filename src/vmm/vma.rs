//! Per-process virtual memory area tracking (spec §4.8): a bounded,
//! sorted, non-overlapping list of regions, and the demand-fault handler
//! that turns a data abort into a resolved mapping (or a signal back to
//! the caller).

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::config::{MAX_STACK_SIZE, MAX_VMAS_PER_PROCESS, PAGE_SIZE};
use crate::mm::cow::COW_TABLE;
use crate::vmm::address_space::{AddressSpace, VmmError};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    Anonymous,
    File,
    Stack,
    Guard,
}

#[derive(Debug, Clone, Copy)]
pub struct Vma {
    pub start: usize,
    pub end: usize,
    pub prot: Prot,
    pub kind: VmaKind,
}

impl Vma {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    Overlap,
    TableFull,
    NotFound,
}

/// Outcome of routing a data-abort fault through the VMA list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Handled,
    Unhandled,
    StackGrow,
    Error,
}

/// Sorted, non-overlapping list of a process's mapped regions, bounded at
/// `MAX_VMAS_PER_PROCESS` entries.
pub struct VmaList {
    vmas: Vec<Vma>,
}

impl VmaList {
    pub const fn new() -> Self {
        Self { vmas: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    fn find_insert_pos(&self, start: usize) -> usize {
        self.vmas.partition_point(|v| v.start < start)
    }

    /// Insert a new VMA, rejecting overlap with any existing region and
    /// enforcing the per-process bound.
    pub fn insert(&mut self, start: usize, end: usize, prot: Prot, kind: VmaKind) -> Result<(), VmaError> {
        if self.vmas.len() >= MAX_VMAS_PER_PROCESS {
            return Err(VmaError::TableFull);
        }
        if self.vmas.iter().any(|v| v.overlaps(start, end)) {
            return Err(VmaError::Overlap);
        }
        let pos = self.find_insert_pos(start);
        self.vmas.insert(pos, Vma { start, end, prot, kind });
        Ok(())
    }

    pub fn remove_range(&mut self, start: usize, end: usize) -> Result<(), VmaError> {
        let before = self.vmas.len();
        self.vmas.retain(|v| !(v.start >= start && v.end <= end));
        if self.vmas.len() == before {
            return Err(VmaError::NotFound);
        }
        Ok(())
    }

    pub fn find(&self, addr: usize) -> Option<&Vma> {
        let pos = self.vmas.partition_point(|v| v.end <= addr);
        self.vmas.get(pos).filter(|v| v.contains(addr))
    }

    /// True if every page in `[ptr, ptr+len)` falls inside a single VMA
    /// whose protection bits include `required`. Spanning a gap or a VMA
    /// lacking the requested bit is rejected.
    pub fn range_permits(&self, ptr: usize, len: usize, required: Prot) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = ptr.checked_add(len) else {
            return false;
        };
        match self.find(ptr) {
            Some(vma) => vma.end >= end && vma.prot.contains(required),
            None => false,
        }
    }

    /// Resolve a data-abort at `addr`. `write` is true for a store abort.
    /// On a COW hit, performs the actual copy and remaps the faulting
    /// process's page read-write; on a STACK-adjacent miss below a stack
    /// VMA, grows it (bounded by `MAX_STACK_SIZE`).
    pub fn handle_fault(&mut self, aspace: &mut AddressSpace, addr: usize, write: bool) -> FaultOutcome {
        let page = addr & !(PAGE_SIZE - 1);

        if let Some(pa) = aspace.translate(page) {
            if write && COW_TABLE.is_cow(pa) {
                return self.resolve_cow(aspace, page, pa);
            }
            return FaultOutcome::Unhandled;
        }

        let Some(idx) = self.vma_index_near(page) else {
            return FaultOutcome::Error;
        };
        let vma = self.vmas[idx];

        if vma.contains(page) {
            if vma.kind == VmaKind::Guard || (write && !vma.prot.contains(Prot::WRITE)) {
                return FaultOutcome::Unhandled;
            }
            return self.demand_map(aspace, &vma, page);
        }

        if vma.kind == VmaKind::Stack && page < vma.start {
            let grown_start = page & !(PAGE_SIZE - 1);
            if vma.end - grown_start > MAX_STACK_SIZE {
                return FaultOutcome::Error;
            }
            self.vmas[idx].start = grown_start;
            let grown = self.vmas[idx];
            return match self.demand_map(aspace, &grown, page) {
                FaultOutcome::Handled => FaultOutcome::StackGrow,
                other => other,
            };
        }

        FaultOutcome::Error
    }

    fn vma_index_near(&self, addr: usize) -> Option<usize> {
        let pos = self.vmas.partition_point(|v| v.end <= addr);
        if pos < self.vmas.len() {
            Some(pos)
        } else {
            None
        }
    }

    fn demand_map(&self, aspace: &mut AddressSpace, vma: &Vma, page: usize) -> FaultOutcome {
        let mut leaf_flags = crate::mmu::flags::AP_RO_ALL;
        if vma.prot.contains(Prot::WRITE) {
            leaf_flags = crate::mmu::flags::AP_RW_ALL;
        }
        if !vma.prot.contains(Prot::EXEC) {
            leaf_flags |= crate::mmu::flags::UXN | crate::mmu::flags::PXN;
        }
        match aspace.alloc_map(page, leaf_flags) {
            Ok(_) => FaultOutcome::Handled,
            Err(VmmError::AlreadyMapped) => FaultOutcome::Handled,
            Err(_) => FaultOutcome::Error,
        }
    }

    fn resolve_cow(&self, aspace: &mut AddressSpace, page: usize, old_pa: usize) -> FaultOutcome {
        let still_shared = COW_TABLE.get_ref(old_pa) > 1;
        if !still_shared {
            COW_TABLE.clear_cow(old_pa);
            if aspace.make_cow_readonly(page).is_err() {
                return FaultOutcome::Error;
            }
            // Sole owner left: reuse the page directly, just flip to RW.
            return FaultOutcome::Handled;
        }

        let Some(new_frame) = crate::mm::pmm::alloc_page() else {
            return FaultOutcome::Error;
        };
        let new_pa = new_frame.start_address();
        unsafe {
            core::ptr::copy_nonoverlapping(
                crate::mmu::phys_to_virt(old_pa),
                crate::mmu::phys_to_virt(new_pa),
                PAGE_SIZE,
            );
        }
        if aspace.unmap(page).is_err() {
            return FaultOutcome::Error;
        }
        if COW_TABLE.dec_ref(old_pa) {
            crate::mm::pmm::free_page(crate::mm::pmm::PhysFrame::new(old_pa));
        }
        match aspace.install_private_copy(page, new_pa) {
            Ok(()) => FaultOutcome::Handled,
            Err(_) => FaultOutcome::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_overlap() {
        let mut list = VmaList::new();
        list.insert(0x1000, 0x2000, Prot::READ, VmaKind::Anonymous).unwrap();
        assert_eq!(
            list.insert(0x1800, 0x2800, Prot::READ, VmaKind::Anonymous),
            Err(VmaError::Overlap)
        );
        list.insert(0x2000, 0x3000, Prot::READ, VmaKind::Anonymous).unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn range_permits_checks_bounds_and_prot() {
        let mut list = VmaList::new();
        list.insert(0x1000, 0x2000, Prot::READ, VmaKind::Anonymous).unwrap();
        assert!(list.range_permits(0x1000, 0x10, Prot::READ));
        assert!(!list.range_permits(0x1000, 0x10, Prot::WRITE));
        assert!(!list.range_permits(0x1FF0, 0x20, Prot::READ)); // spans the end
        assert!(!list.range_permits(0x5000, 0x10, Prot::READ)); // no vma
    }

    #[test]
    fn find_locates_containing_vma() {
        let mut list = VmaList::new();
        list.insert(0x1000, 0x2000, Prot::READ, VmaKind::Anonymous).unwrap();
        list.insert(0x3000, 0x4000, Prot::READ | Prot::WRITE, VmaKind::Anonymous).unwrap();
        assert!(list.find(0x1500).is_some());
        assert!(list.find(0x2500).is_none());
        assert!(list.find(0x3500).unwrap().prot.contains(Prot::WRITE));
    }
}

//! Copy-on-write page bookkeeping (spec §4.5): a flat `PageInfo` array
//! indexed by `(phys - ram_start) / PAGE_SIZE`, each entry a 32-bit packed
//! refcount + flag set updated via lock-free CAS loops.

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::mmu::PAGE_SIZE;

const REFCOUNT_MASK: u32 = 0x0000_FFFF;
const FLAG_COW: u32 = 1 << 16;
const FLAG_SHARED: u32 = 1 << 17;

/// Global COW bookkeeping table, sized to cover all of managed RAM. Every
/// per-page operation is a lock-free CAS on its own `AtomicU32` entry; the
/// backing `Vec` itself is written exactly once, by `init`, during
/// single-threaded boot before any other method can run, so it's kept
/// behind an `UnsafeCell` rather than a lock that every hot-path op would
/// otherwise have to take.
pub struct CowTable {
    ram_start: AtomicUsize,
    entries: UnsafeCell<Vec<AtomicU32>>,
}

unsafe impl Send for CowTable {}
unsafe impl Sync for CowTable {}

impl CowTable {
    pub const fn empty() -> Self {
        Self {
            ram_start: AtomicUsize::new(0),
            entries: UnsafeCell::new(Vec::new()),
        }
    }

    /// Must run exactly once, during boot, before any other `CowTable`
    /// method is called.
    pub fn init(&self, ram_start: usize, ram_size: usize) {
        self.ram_start.store(ram_start, Ordering::Release);
        let count = ram_size / PAGE_SIZE;
        unsafe {
            *self.entries.get() = (0..count).map(|_| AtomicU32::new(0)).collect();
        }
    }

    fn entries(&self) -> &[AtomicU32] {
        unsafe { &*self.entries.get() }
    }

    fn index_of(&self, phys: usize) -> Option<usize> {
        let ram_start = self.ram_start.load(Ordering::Acquire);
        if phys < ram_start {
            return None;
        }
        let idx = (phys - ram_start) / PAGE_SIZE;
        if idx < self.entries().len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Increment the refcount for the page at `phys`.
    pub fn inc_ref(&self, phys: usize) {
        let Some(idx) = self.index_of(phys) else { return };
        let cell = &self.entries()[idx];
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let refcount = (cur & REFCOUNT_MASK) + 1;
            let new = (cur & !REFCOUNT_MASK) | (refcount & REFCOUNT_MASK);
            match cell.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Decrement the refcount for the page at `phys`. Returns `true` when
    /// the refcount transitions to zero, signaling the caller should free
    /// the frame.
    pub fn dec_ref(&self, phys: usize) -> bool {
        let Some(idx) = self.index_of(phys) else { return false };
        let cell = &self.entries()[idx];
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let refcount = cur & REFCOUNT_MASK;
            if refcount == 0 {
                return false;
            }
            let new_refcount = refcount - 1;
            let new = (cur & !REFCOUNT_MASK) | new_refcount;
            match cell.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return new_refcount == 0,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn mark_cow(&self, phys: usize) {
        self.set_flag(phys, FLAG_COW);
    }

    pub fn clear_cow(&self, phys: usize) {
        self.clear_flag(phys, FLAG_COW);
    }

    pub fn is_cow(&self, phys: usize) -> bool {
        self.index_of(phys)
            .map(|idx| self.entries()[idx].load(Ordering::Acquire) & FLAG_COW != 0)
            .unwrap_or(false)
    }

    pub fn mark_shared(&self, phys: usize) {
        self.set_flag(phys, FLAG_SHARED);
    }

    pub fn is_shared(&self, phys: usize) -> bool {
        self.index_of(phys)
            .map(|idx| self.entries()[idx].load(Ordering::Acquire) & FLAG_SHARED != 0)
            .unwrap_or(false)
    }

    pub fn get_ref(&self, phys: usize) -> u32 {
        self.index_of(phys)
            .map(|idx| self.entries()[idx].load(Ordering::Acquire) & REFCOUNT_MASK)
            .unwrap_or(0)
    }

    fn set_flag(&self, phys: usize, flag: u32) {
        let Some(idx) = self.index_of(phys) else { return };
        let cell = &self.entries()[idx];
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let new = cur | flag;
            if new == cur {
                return;
            }
            match cell.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn clear_flag(&self, phys: usize, flag: u32) {
        let Some(idx) = self.index_of(phys) else { return };
        let cell = &self.entries()[idx];
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let new = cur & !flag;
            if new == cur {
                return;
            }
            match cell.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

pub static COW_TABLE: CowTable = CowTable::empty();

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table() -> CowTable {
        let t = CowTable::empty();
        t.init(0x1000_0000, 16 * PAGE_SIZE);
        t
    }

    #[test]
    fn inc_dec_ref_roundtrip() {
        let t = make_table();
        let phys = 0x1000_0000 + 3 * PAGE_SIZE;
        assert_eq!(t.get_ref(phys), 0);
        t.inc_ref(phys);
        t.inc_ref(phys);
        assert_eq!(t.get_ref(phys), 2);
        assert!(!t.dec_ref(phys));
        assert!(t.dec_ref(phys));
        assert_eq!(t.get_ref(phys), 0);
    }

    #[test]
    fn cow_flag_independent_of_refcount() {
        let t = make_table();
        let phys = 0x1000_0000;
        t.inc_ref(phys);
        t.mark_cow(phys);
        assert!(t.is_cow(phys));
        assert_eq!(t.get_ref(phys), 1);
        t.clear_cow(phys);
        assert!(!t.is_cow(phys));
        assert_eq!(t.get_ref(phys), 1);
    }

    #[test]
    fn out_of_range_is_noop() {
        let t = make_table();
        assert_eq!(t.get_ref(0), 0);
        assert!(!t.dec_ref(0));
        t.inc_ref(0); // must not panic
    }
}

//! Physical Memory Manager (PMM)
//!
//! RAM is split at the framebuffer reservation. The larger region above it
//! is handed to the buddy allocator (`mm::buddy`) for power-of-two runs; the
//! narrower region below (kernel image + bitmap storage + small tail) is
//! tracked by a word-scanned bitmap, one bit per page. `alloc_page`/
//! `alloc_pages` try the buddy allocator first and fall back to the bitmap
//! on exhaustion; `free_page`/`free_pages` route back to the owning
//! allocator by address range.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spinning_top::Spinlock;

use crate::config::PMM_LOW_REGION_SIZE;
use crate::mm::buddy::BuddyAllocator;
use crate::mmu::PAGE_SIZE;

// ============================================================================
// Debug Frame Tracking
// ============================================================================

/// Enable debug frame tracking (adds overhead but helps find leaks)
/// Set to true to track all frame allocations with metadata
pub const DEBUG_FRAME_TRACKING: bool = true;

/// Allocation source for debug tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// Kernel heap allocation
    Kernel,
    /// User page table
    UserPageTable,
    /// User data page (mmap/brk)
    UserData,
    /// ELF loader (code/data segments)
    ElfLoader,
    /// Unknown/unspecified
    Unknown,
}

/// Information about a tracked frame allocation
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Source of the allocation
    pub source: FrameSource,
    /// Process ID (0 for kernel)
    pub pid: u32,
}

/// Debug tracker for frame allocations
struct FrameTracker {
    /// Map of physical address to allocation info
    allocations: BTreeMap<usize, FrameInfo>,
    /// Count of current allocations by source
    kernel_count: usize,
    user_page_table_count: usize,
    user_data_count: usize,
    elf_loader_count: usize,
    unknown_count: usize,
    /// Cumulative stats
    total_tracked: usize,
    total_untracked: usize,
}

impl FrameTracker {
    const fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            kernel_count: 0,
            user_page_table_count: 0,
            user_data_count: 0,
            elf_loader_count: 0,
            unknown_count: 0,
            total_tracked: 0,
            total_untracked: 0,
        }
    }

    fn track(&mut self, addr: usize, source: FrameSource, pid: u32) {
        if let Some(old) = self.allocations.insert(addr, FrameInfo { source, pid }) {
            crate::console::print(&alloc::format!(
                "[PMM WARN] Double allocation at 0x{:x}! Old: {:?}, New: {:?}\n",
                addr, old.source, source
            ));
        }
        match source {
            FrameSource::Kernel => self.kernel_count += 1,
            FrameSource::UserPageTable => self.user_page_table_count += 1,
            FrameSource::UserData => self.user_data_count += 1,
            FrameSource::ElfLoader => self.elf_loader_count += 1,
            FrameSource::Unknown => self.unknown_count += 1,
        }
        self.total_tracked += 1;
    }

    fn untrack(&mut self, addr: usize) -> Option<FrameInfo> {
        if let Some(info) = self.allocations.remove(&addr) {
            match info.source {
                FrameSource::Kernel => self.kernel_count = self.kernel_count.saturating_sub(1),
                FrameSource::UserPageTable => {
                    self.user_page_table_count = self.user_page_table_count.saturating_sub(1)
                }
                FrameSource::UserData => self.user_data_count = self.user_data_count.saturating_sub(1),
                FrameSource::ElfLoader => self.elf_loader_count = self.elf_loader_count.saturating_sub(1),
                FrameSource::Unknown => self.unknown_count = self.unknown_count.saturating_sub(1),
            }
            self.total_untracked += 1;
            Some(info)
        } else {
            crate::console::print(&alloc::format!(
                "[PMM WARN] Freeing untracked frame at 0x{:x}\n",
                addr
            ));
            None
        }
    }

    fn leak_count(&self) -> usize {
        self.allocations.len()
    }

    fn stats(&self) -> FrameTrackingStats {
        FrameTrackingStats {
            current_tracked: self.allocations.len(),
            kernel_count: self.kernel_count,
            user_page_table_count: self.user_page_table_count,
            user_data_count: self.user_data_count,
            elf_loader_count: self.elf_loader_count,
            unknown_count: self.unknown_count,
            total_tracked: self.total_tracked,
            total_untracked: self.total_untracked,
        }
    }
}

/// Statistics from frame tracking
#[derive(Debug, Clone)]
pub struct FrameTrackingStats {
    pub current_tracked: usize,
    pub kernel_count: usize,
    pub user_page_table_count: usize,
    pub user_data_count: usize,
    pub elf_loader_count: usize,
    pub unknown_count: usize,
    /// Cumulative totals
    pub total_tracked: usize,
    pub total_untracked: usize,
}

static FRAME_TRACKER: Spinlock<FrameTracker> = Spinlock::new(FrameTracker::new());

/// Track a frame allocation (only if DEBUG_FRAME_TRACKING is enabled)
pub fn track_frame(frame: PhysFrame, source: FrameSource, pid: u32) {
    if DEBUG_FRAME_TRACKING {
        FRAME_TRACKER.lock().track(frame.addr, source, pid);
    }
}

/// Untrack a frame (only if DEBUG_FRAME_TRACKING is enabled)
pub fn untrack_frame(frame: PhysFrame) {
    if DEBUG_FRAME_TRACKING {
        FRAME_TRACKER.lock().untrack(frame.addr);
    }
}

/// Get frame tracking statistics
pub fn tracking_stats() -> Option<FrameTrackingStats> {
    if DEBUG_FRAME_TRACKING {
        Some(FRAME_TRACKER.lock().stats())
    } else {
        None
    }
}

/// Get number of potentially leaked frames (only meaningful if DEBUG_FRAME_TRACKING is enabled)
pub fn leak_count() -> usize {
    if DEBUG_FRAME_TRACKING {
        FRAME_TRACKER.lock().leak_count()
    } else {
        0
    }
}

/// Physical page frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysFrame {
    pub addr: usize,
}

impl PhysFrame {
    pub const fn new(addr: usize) -> Self {
        Self {
            addr: addr & !(PAGE_SIZE - 1),
        }
    }

    pub fn containing_address(addr: usize) -> Self {
        Self::new(addr)
    }

    pub fn start_address(&self) -> usize {
        self.addr
    }
}

/// Bitmap-based physical memory allocator, used for the low region (kernel
/// image + bitmap storage + small tail, below the buddy region's base).
struct BitmapAllocator {
    /// Bitmap where each bit represents a page (1 = free, 0 = used)
    bitmap: Vec<u64>,
    base_addr: usize,
    total_pages: usize,
    free_pages: usize,
    next_free_hint: usize,
}

impl BitmapAllocator {
    const fn new() -> Self {
        Self {
            bitmap: Vec::new(),
            base_addr: 0,
            total_pages: 0,
            free_pages: 0,
            next_free_hint: 0,
        }
    }

    fn init(&mut self, base: usize, size: usize, kernel_end: usize) {
        self.base_addr = base;
        self.total_pages = size / PAGE_SIZE;

        let bitmap_size = (self.total_pages + 63) / 64;
        self.bitmap = alloc::vec![!0u64; bitmap_size];

        let kernel_pages = (kernel_end.saturating_sub(base) + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..kernel_pages.min(self.total_pages) {
            self.mark_used(i);
        }

        self.free_pages = self.total_pages - kernel_pages.min(self.total_pages);
        self.next_free_hint = kernel_pages;

        let remaining = self.total_pages % 64;
        if remaining != 0 {
            let last_idx = bitmap_size - 1;
            let mask = (1u64 << remaining) - 1;
            self.bitmap[last_idx] &= mask;
        }
    }

    fn in_region(&self, addr: usize) -> bool {
        addr >= self.base_addr && addr < self.base_addr + self.total_pages * PAGE_SIZE
    }

    fn mark_used(&mut self, page_idx: usize) {
        let word_idx = page_idx / 64;
        let bit_idx = page_idx % 64;
        if word_idx < self.bitmap.len() {
            self.bitmap[word_idx] &= !(1u64 << bit_idx);
        }
    }

    fn mark_free(&mut self, page_idx: usize) {
        let word_idx = page_idx / 64;
        let bit_idx = page_idx % 64;
        if word_idx < self.bitmap.len() {
            self.bitmap[word_idx] |= 1u64 << bit_idx;
        }
    }

    fn is_free(&self, page_idx: usize) -> bool {
        let word_idx = page_idx / 64;
        let bit_idx = page_idx % 64;
        if word_idx < self.bitmap.len() {
            (self.bitmap[word_idx] & (1u64 << bit_idx)) != 0
        } else {
            false
        }
    }

    fn alloc_page(&mut self) -> Option<PhysFrame> {
        let start_word = self.next_free_hint / 64;

        for word_idx in start_word..self.bitmap.len() {
            if self.bitmap[word_idx] != 0 {
                let bit_idx = self.bitmap[word_idx].trailing_zeros() as usize;
                let page_idx = word_idx * 64 + bit_idx;
                if page_idx < self.total_pages {
                    self.mark_used(page_idx);
                    self.free_pages -= 1;
                    self.next_free_hint = page_idx + 1;
                    return Some(PhysFrame::new(self.base_addr + page_idx * PAGE_SIZE));
                }
            }
        }
        for word_idx in 0..start_word {
            if self.bitmap[word_idx] != 0 {
                let bit_idx = self.bitmap[word_idx].trailing_zeros() as usize;
                let page_idx = word_idx * 64 + bit_idx;
                if page_idx < self.total_pages {
                    self.mark_used(page_idx);
                    self.free_pages -= 1;
                    self.next_free_hint = page_idx + 1;
                    return Some(PhysFrame::new(self.base_addr + page_idx * PAGE_SIZE));
                }
            }
        }
        None
    }

    fn alloc_pages(&mut self, count: usize) -> Option<PhysFrame> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.alloc_page();
        }

        let mut start = 0;
        let mut found = 0;
        for page_idx in 0..self.total_pages {
            if self.is_free(page_idx) {
                if found == 0 {
                    start = page_idx;
                }
                found += 1;
                if found == count {
                    for i in start..start + count {
                        self.mark_used(i);
                    }
                    self.free_pages -= count;
                    self.next_free_hint = start + count;
                    return Some(PhysFrame::new(self.base_addr + start * PAGE_SIZE));
                }
            } else {
                found = 0;
            }
        }
        None
    }

    fn free_page(&mut self, frame: PhysFrame) {
        if frame.addr < self.base_addr {
            return;
        }
        let page_idx = (frame.addr - self.base_addr) / PAGE_SIZE;
        if page_idx < self.total_pages && !self.is_free(page_idx) {
            self.mark_free(page_idx);
            self.free_pages += 1;
            if page_idx < self.next_free_hint {
                self.next_free_hint = page_idx;
            }
        } else {
            crate::console::print(&alloc::format!(
                "[PMM WARN] double-free or out-of-range bitmap free at 0x{:x}\n",
                frame.addr
            ));
        }
    }

    fn free_pages(&mut self, frame: PhysFrame, count: usize) {
        for i in 0..count {
            self.free_page(PhysFrame::new(frame.addr + i * PAGE_SIZE));
        }
    }
}

/// Smallest order `k` such that `2^k >= count`.
fn order_for_count(count: usize) -> u8 {
    let count = count.max(1);
    (usize::BITS - (count - 1).leading_zeros()) as u8
}

/// Combined bitmap + buddy physical memory allocator state.
struct Pmm {
    bitmap: BitmapAllocator,
    buddy: BuddyAllocator,
    /// Outstanding multi-page buddy allocations: base address -> order, so
    /// `free_pages` can hand the exact run back to the buddy allocator.
    buddy_orders: BTreeMap<usize, u8>,
}

impl Pmm {
    const fn new() -> Self {
        Self {
            bitmap: BitmapAllocator::new(),
            buddy: BuddyAllocator::new(),
            buddy_orders: BTreeMap::new(),
        }
    }
}

static PMM: Spinlock<Pmm> = Spinlock::new(Pmm::new());

static TOTAL_PAGES: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_PAGES: AtomicUsize = AtomicUsize::new(0);

/// Initialize the physical memory manager.
///
/// `ram_base`/`ram_size` describe all of usable RAM; `kernel_end` is the end
/// of kernel code+data+bitmap storage. The region `[ram_base, ram_base +
/// PMM_LOW_REGION_SIZE)` is tracked by the bitmap allocator (kernel image,
/// bitmap storage, small tail); everything above that — the framebuffer
/// reservation and beyond — is handed to the buddy allocator.
pub fn init(ram_base: usize, ram_size: usize, kernel_end: usize) {
    let low_size = PMM_LOW_REGION_SIZE.min(ram_size);
    let buddy_base = ram_base + low_size;
    let buddy_size = ram_size.saturating_sub(low_size);

    let mut pmm = PMM.lock();
    pmm.bitmap.init(ram_base, low_size, kernel_end);
    if buddy_size >= PAGE_SIZE {
        pmm.buddy.init(buddy_base, buddy_size / PAGE_SIZE);
    }

    let total_pages = ram_size / PAGE_SIZE;
    let free_pages = pmm.bitmap.free_pages + pmm.buddy.free_pages();
    TOTAL_PAGES.store(total_pages, Ordering::Release);
    ALLOCATED_PAGES.store(total_pages - free_pages, Ordering::Release);
}

/// Allocate a single physical page. Tries the buddy allocator first, falls
/// back to the bitmap allocator on exhaustion.
pub fn alloc_page() -> Option<PhysFrame> {
    let mut pmm = PMM.lock();
    if let Some(addr) = pmm.buddy.alloc(0) {
        ALLOCATED_PAGES.fetch_add(1, Ordering::Relaxed);
        return Some(PhysFrame::new(addr));
    }
    let result = pmm.bitmap.alloc_page();
    if result.is_some() {
        ALLOCATED_PAGES.fetch_add(1, Ordering::Relaxed);
    }
    result
}

/// Allocate `count` contiguous physical pages.
pub fn alloc_pages(count: usize) -> Option<PhysFrame> {
    if count == 0 {
        return None;
    }
    let order = order_for_count(count);

    let mut pmm = PMM.lock();
    if let Some(addr) = pmm.buddy.alloc(order) {
        pmm.buddy_orders.insert(addr, order);
        ALLOCATED_PAGES.fetch_add(1usize << order, Ordering::Relaxed);
        return Some(PhysFrame::new(addr));
    }
    let result = pmm.bitmap.alloc_pages(count);
    if result.is_some() {
        ALLOCATED_PAGES.fetch_add(count, Ordering::Relaxed);
    }
    result
}

/// Free a single physical page, routing to the owning allocator by address.
pub fn free_page(frame: PhysFrame) {
    untrack_frame(frame);

    let mut pmm = PMM.lock();
    if pmm.buddy.in_region(frame.addr) {
        if let Some(order) = pmm.buddy_orders.remove(&frame.addr) {
            // A tracked multi-page run being freed one page at a time would
            // be a caller bug; treat it as a single-page free of that slot.
            pmm.buddy.free(frame.addr, order);
            ALLOCATED_PAGES.fetch_sub(1usize << order, Ordering::Relaxed);
        } else {
            pmm.buddy.free(frame.addr, 0);
            ALLOCATED_PAGES.fetch_sub(1, Ordering::Relaxed);
        }
    } else {
        pmm.bitmap.free_page(frame);
        ALLOCATED_PAGES.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Free `count` contiguous physical pages, routing to the owning allocator.
pub fn free_pages(frame: PhysFrame, count: usize) {
    let mut pmm = PMM.lock();
    if pmm.buddy.in_region(frame.addr) {
        if let Some(order) = pmm.buddy_orders.remove(&frame.addr) {
            pmm.buddy.free(frame.addr, order);
            ALLOCATED_PAGES.fetch_sub(1usize << order, Ordering::Relaxed);
        } else {
            let order = order_for_count(count);
            pmm.buddy.free(frame.addr, order);
            ALLOCATED_PAGES.fetch_sub(1usize << order, Ordering::Relaxed);
        }
    } else {
        pmm.bitmap.free_pages(frame, count);
        ALLOCATED_PAGES.fetch_sub(count, Ordering::Relaxed);
    }
}

/// Total pages managed across both regions.
pub fn get_total_pages() -> usize {
    TOTAL_PAGES.load(Ordering::Relaxed)
}

/// Pages currently in use.
pub fn get_used_pages() -> usize {
    ALLOCATED_PAGES.load(Ordering::Relaxed)
}

/// Pages currently free.
pub fn get_free_pages() -> usize {
    get_total_pages().saturating_sub(get_used_pages())
}

/// Get physical memory statistics as (total, used, free).
pub fn stats() -> (usize, usize, usize) {
    (get_total_pages(), get_used_pages(), get_free_pages())
}

/// Allocate a zeroed page.
pub fn alloc_page_zeroed() -> Option<PhysFrame> {
    use crate::mmu::phys_to_virt;

    let frame = alloc_page()?;
    unsafe {
        let virt_addr = phys_to_virt(frame.addr);
        core::ptr::write_bytes(virt_addr, 0, PAGE_SIZE);

        const CACHE_LINE_SIZE: usize = 64;
        let mut addr = virt_addr as usize;
        let end = addr + PAGE_SIZE;
        while addr < end {
            core::arch::asm!(
                "dc cvac, {addr}",
                addr = in(reg) addr,
            );
            addr += CACHE_LINE_SIZE;
        }
        core::arch::asm!("dsb ish");
    }
    Some(frame)
}

/// Allocate zeroed contiguous pages.
pub fn alloc_pages_zeroed(count: usize) -> Option<PhysFrame> {
    use crate::mmu::phys_to_virt;

    let frame = alloc_pages(count)?;
    let total_size = PAGE_SIZE * count;
    unsafe {
        let virt_addr = phys_to_virt(frame.addr);
        core::ptr::write_bytes(virt_addr, 0, total_size);

        const CACHE_LINE_SIZE: usize = 64;
        let mut addr = virt_addr as usize;
        let end = addr + total_size;
        while addr < end {
            core::arch::asm!(
                "dc cvac, {addr}",
                addr = in(reg) addr,
            );
            addr += CACHE_LINE_SIZE;
        }
        core::arch::asm!("dsb ish");
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_for_count_rounds_up_to_power_of_two() {
        assert_eq!(order_for_count(1), 0);
        assert_eq!(order_for_count(2), 1);
        assert_eq!(order_for_count(3), 2);
        assert_eq!(order_for_count(4), 2);
        assert_eq!(order_for_count(5), 3);
        assert_eq!(order_for_count(9), 4);
    }
}

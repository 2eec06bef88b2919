//! Slab allocator (spec §4.4): fixed-size object caches backed by single
//! pages from the PMM. Ownership of a pointer is an O(1) check — every slab
//! starts at a page boundary, so `ptr & ~(PAGE_SIZE-1)` recovers the slab
//! header, which carries a back-pointer to its owning cache.

use alloc::vec::Vec;
use spinning_top::Spinlock;

use crate::mm::pmm;
use crate::mmu::{phys_to_virt, PAGE_SIZE};

const fn align8(size: usize) -> usize {
    (size.max(core::mem::size_of::<usize>()) + 7) & !7
}

/// Header placed at the start of every slab page. `cache` is the back
/// pointer used for the O(1) ownership check in `free`.
#[repr(C)]
struct SlabHeader {
    cache: *const SlabCacheInner,
    free_list: usize,
    in_use: u32,
    capacity: u32,
}

struct Slab {
    page: usize,
}

fn header_at(page: usize) -> *mut SlabHeader {
    phys_to_virt(page) as *mut SlabHeader
}

struct SlabCacheInner {
    object_size: usize,
    objects_per_slab: usize,
    slabs: Vec<Slab>,
    partial: Vec<usize>, // indices into `slabs` with at least one free object
}

const fn header_size_aligned() -> usize {
    align8(core::mem::size_of::<SlabHeader>())
}

impl SlabCacheInner {
    const fn new(object_size: usize) -> Self {
        let object_size = align8(object_size);
        let usable = PAGE_SIZE - header_size_aligned();
        let objects_per_slab = if usable / object_size > 0 {
            usable / object_size
        } else {
            1
        };
        Self {
            object_size,
            objects_per_slab,
            slabs: Vec::new(),
            partial: Vec::new(),
        }
    }

    fn object_at(&self, page: usize, slot: usize) -> usize {
        page + header_size_aligned() + slot * self.object_size
    }

    fn grow(&mut self, self_ptr: *const SlabCacheInner) -> Result<usize, SlabError> {
        let frame = pmm::alloc_page().ok_or(SlabError::OutOfMemory)?;
        let page = frame.start_address();

        // Thread the free list through each slot: slot i's first word points
        // to slot i+1's address, 0 at the tail.
        for slot in 0..self.objects_per_slab {
            let obj = self.object_at(page, slot);
            let next = if slot + 1 < self.objects_per_slab {
                self.object_at(page, slot + 1)
            } else {
                0
            };
            unsafe {
                *(phys_to_virt(obj) as *mut usize) = next;
            }
        }

        unsafe {
            let hdr = header_at(page);
            (*hdr).cache = self_ptr;
            (*hdr).free_list = self.object_at(page, 0);
            (*hdr).in_use = 0;
            (*hdr).capacity = self.objects_per_slab as u32;
        }

        self.slabs.push(Slab { page });
        let idx = self.slabs.len() - 1;
        self.partial.push(idx);
        Ok(idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    OutOfMemory,
    WrongCache,
    DoubleFree,
}

pub struct SlabCache {
    inner: Spinlock<SlabCacheInner>,
}

impl SlabCache {
    pub const fn new(object_size: usize) -> Self {
        Self {
            inner: Spinlock::new(SlabCacheInner::new(object_size)),
        }
    }

    pub fn object_size(&self) -> usize {
        self.inner.lock().object_size
    }

    pub fn alloc(&self) -> Result<*mut u8, SlabError> {
        let self_ptr = self as *const SlabCache as *const SlabCacheInner;
        let mut inner = self.inner.lock();

        if inner.partial.is_empty() {
            inner.grow(self_ptr)?;
        }

        let &slab_idx = inner.partial.last().expect("just grew");
        let page = inner.slabs[slab_idx].page;
        let hdr = header_at(page);

        unsafe {
            let obj = (*hdr).free_list;
            let next = *(phys_to_virt(obj) as *const usize);
            (*hdr).free_list = next;
            (*hdr).in_use += 1;
            if (*hdr).free_list == 0 {
                inner.partial.pop();
            }
            Ok(phys_to_virt(obj))
        }
    }

    /// Free an object previously returned by `alloc`. Validates ownership
    /// via the slab's back-pointer and scans the free list for a matching
    /// entry (double-free detection) before relinking.
    pub fn free(&self, ptr: *mut u8) -> Result<(), SlabError> {
        let self_ptr = self as *const SlabCache as *const SlabCacheInner;
        let page = (ptr as usize) & !(PAGE_SIZE - 1);
        let hdr = header_at(page);

        let mut inner = self.inner.lock();
        unsafe {
            if (*hdr).cache != self_ptr {
                return Err(SlabError::WrongCache);
            }

            let obj_phys = ptr as usize;
            let mut cur = (*hdr).free_list;
            while cur != 0 {
                if cur == obj_phys {
                    return Err(SlabError::DoubleFree);
                }
                cur = *(phys_to_virt(cur) as *const usize);
            }

            let was_full = (*hdr).free_list == 0;
            *(phys_to_virt(obj_phys) as *mut usize) = (*hdr).free_list;
            (*hdr).free_list = obj_phys;
            (*hdr).in_use -= 1;

            if was_full {
                if let Some(idx) = inner.slabs.iter().position(|s| s.page == page) {
                    inner.partial.push(idx);
                }
            }
        }
        Ok(())
    }

    /// Walk `slab_list`, unlink and free to the PMM any slab with no
    /// outstanding objects. `slabs.retain` shifts every surviving slab's
    /// index down, which stale `partial` indices don't track, so `partial`
    /// is rebuilt from scratch by rescanning the surviving slabs rather
    /// than filtered in place.
    pub fn reap(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut freed_pages = Vec::new();
        inner.slabs.retain(|slab| {
            let hdr = header_at(slab.page);
            let empty = unsafe { (*hdr).in_use == 0 };
            if empty {
                freed_pages.push(slab.page);
            }
            !empty
        });
        for page in &freed_pages {
            pmm::free_page(pmm::PhysFrame::new(*page));
        }

        let objects_per_slab = inner.objects_per_slab as u32;
        inner.partial = inner
            .slabs
            .iter()
            .enumerate()
            .filter_map(|(idx, slab)| {
                let hdr = header_at(slab.page);
                let in_use = unsafe { (*hdr).in_use };
                (in_use < objects_per_slab).then_some(idx)
            })
            .collect();

        freed_pages.len()
    }
}

unsafe impl Send for SlabCache {}
unsafe impl Sync for SlabCache {}

/// Standard pre-created caches, sized for representative kernel object
/// shapes (actual struct sizes are filled in where those modules live).
pub static INODE_CACHE: SlabCache = SlabCache::new(256);
pub static TASK_CACHE: SlabCache = SlabCache::new(512);
pub static VIPER_CACHE: SlabCache = SlabCache::new(256);
pub static CHANNEL_CACHE: SlabCache = SlabCache::new(128);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }

    #[test]
    fn reap_rebuilds_partial_instead_of_filtering_stale_indices() {
        let cache = SlabCache::new(64);

        // Grow three slabs, fill every object in the first two and leave
        // the third with free slots, then free everything in slab 0 so
        // it's the one `reap` removes.
        let mut ptrs = Vec::new();
        for _ in 0..cache.inner.lock().objects_per_slab * 3 {
            ptrs.push(cache.alloc().unwrap());
        }
        let per_slab = cache.inner.lock().objects_per_slab;
        for &p in &ptrs[0..per_slab] {
            cache.free(p).unwrap();
        }

        cache.reap();

        // Slab 0 (now empty) is gone; slabs 1 and 2 shifted down to
        // indices 0 and 1. `partial` must point at whichever of those is
        // not completely full, not at stale pre-reap indices.
        let inner = cache.inner.lock();
        assert_eq!(inner.slabs.len(), 2);
        for &idx in &inner.partial {
            assert!(idx < inner.slabs.len());
            let hdr = header_at(inner.slabs[idx].page);
            let in_use = unsafe { (*hdr).in_use };
            assert!(in_use < inner.objects_per_slab as u32);
        }
    }
}

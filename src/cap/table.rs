//! The capability table itself: a free-list-threaded slot array (the same
//! "free slots form a list, in place" technique as `mm::slab`'s object
//! free lists), generation-tagged so a stale `Handle` into a reused slot
//! is rejected rather than silently resolving to the wrong object.

use alloc::vec::Vec;
use bitflags::bitflags;
use spinning_top::Spinlock;

use crate::config::{CAP_FREELIST_END, CAP_NO_PARENT, MAX_CAPS_PER_TABLE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapRights: u16 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        const GRANT  = 1 << 3; // may `derive` a child capability
        const REVOKE = 1 << 4; // may `revoke` this capability's subtree
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Memory,
    Channel,
    Process,
    Viper,
    File,
}

/// A handle's 32 bits pack a 24-bit slot index and an 8-bit generation
/// counter; the generation changes every time a slot is reused so a
/// lingering copy of an old handle can't address a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(u32);

impl Handle {
    const INDEX_MASK: u32 = 0x00FF_FFFF;

    pub fn new(index: u32, generation: u8) -> Self {
        Self((index & Self::INDEX_MASK) | ((generation as u32) << 24))
    }

    pub fn index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }

    pub fn generation(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    InvalidHandle,
    StaleGeneration,
    TableFull,
    PermissionDenied,
    HasChildren,
}

#[derive(Clone)]
pub struct CapEntry {
    pub kind: ObjectKind,
    pub object: u64,
    pub rights: CapRights,
    generation: u8,
    parent: u32,
    first_child: u32,
    next_sibling: u32,
}

enum Slot {
    /// `generation` carries the last-used generation even while free, so
    /// the next occupant's generation can be bumped past it.
    Free { next: u32, generation: u8 },
    Used(CapEntry),
}

pub struct CapTableInner {
    slots: Vec<Slot>,
    free_head: u32,
    live: usize,
}

impl CapTableInner {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: CAP_FREELIST_END,
            live: 0,
        }
    }

    /// Pop a slot off the free list (or grow the table), returning its
    /// index and the generation the new occupant should use.
    fn alloc_slot(&mut self) -> (u32, u8) {
        if self.free_head != CAP_FREELIST_END {
            let idx = self.free_head;
            let generation = if let Slot::Free { next, generation } = self.slots[idx as usize] {
                self.free_head = next;
                generation.wrapping_add(1)
            } else {
                0
            };
            (idx, generation)
        } else {
            self.slots.push(Slot::Free {
                next: CAP_FREELIST_END,
                generation: 0xFF,
            });
            ((self.slots.len() - 1) as u32, 0)
        }
    }

    fn resolve(&self, handle: Handle) -> Result<&CapEntry, CapError> {
        let slot = self
            .slots
            .get(handle.index() as usize)
            .ok_or(CapError::InvalidHandle)?;
        match slot {
            Slot::Used(entry) if entry.generation == handle.generation() => Ok(entry),
            Slot::Used(_) => Err(CapError::StaleGeneration),
            Slot::Free { .. } => Err(CapError::InvalidHandle),
        }
    }
}

/// A process's capability table: a locked, bounded, generation-checked
/// handle space.
pub struct CapTable {
    inner: Spinlock<CapTableInner>,
}

impl CapTable {
    pub const fn new() -> Self {
        Self {
            inner: Spinlock::new(CapTableInner::new()),
        }
    }

    /// Insert a root (non-derived) capability, growing the table without
    /// bound (other than slot index width).
    pub fn insert(&self, kind: ObjectKind, object: u64, rights: CapRights) -> Handle {
        self.insert_with_parent(kind, object, rights, CAP_NO_PARENT)
    }

    /// Same as `insert`, but rejects growth past `MAX_CAPS_PER_TABLE` live
    /// entries and ANDs `rights` with `bounding_set` before insertion. This
    /// is the only path by which untrusted code mints a new handle from
    /// scratch; `derive` can only narrow an existing one.
    pub fn insert_bounded(
        &self,
        kind: ObjectKind,
        object: u64,
        rights: CapRights,
        bounding_set: CapRights,
    ) -> Result<Handle, CapError> {
        let mut inner = self.inner.lock();
        if inner.live >= MAX_CAPS_PER_TABLE {
            return Err(CapError::TableFull);
        }
        drop(inner);
        Ok(self.insert_with_parent(kind, object, rights & bounding_set, CAP_NO_PARENT))
    }

    fn insert_with_parent(&self, kind: ObjectKind, object: u64, rights: CapRights, parent: u32) -> Handle {
        let mut inner = self.inner.lock();
        let (idx, generation) = inner.alloc_slot();
        inner.slots[idx as usize] = Slot::Used(CapEntry {
            kind,
            object,
            rights,
            generation,
            parent,
            first_child: CAP_NO_PARENT,
            next_sibling: CAP_NO_PARENT,
        });
        inner.live += 1;

        if parent != CAP_NO_PARENT {
            if let Some(Slot::Used(parent_entry)) = inner.slots.get_mut(parent as usize) {
                let old_head = parent_entry.first_child;
                parent_entry.first_child = idx;
                if let Slot::Used(child) = &mut inner.slots[idx as usize] {
                    child.next_sibling = old_head;
                }
            }
        }

        Handle::new(idx, generation)
    }

    pub fn get(&self, handle: Handle) -> Option<CapEntry> {
        self.inner.lock().resolve(handle).ok().cloned()
    }

    pub fn get_checked(&self, handle: Handle) -> Result<CapEntry, CapError> {
        self.inner.lock().resolve(handle).cloned()
    }

    /// Resolve `handle`, additionally requiring every bit in `required` be
    /// present on the capability's rights.
    pub fn get_with_rights(&self, handle: Handle, required: CapRights) -> Result<CapEntry, CapError> {
        let entry = self.get_checked(handle)?;
        if entry.rights.contains(required) {
            Ok(entry)
        } else {
            Err(CapError::PermissionDenied)
        }
    }

    /// Create a child capability over the same object with a rights set
    /// that must be a subset of the parent's. Requires `GRANT` on the
    /// parent.
    pub fn derive(&self, handle: Handle, child_rights: CapRights) -> Result<Handle, CapError> {
        let parent = self.get_with_rights(handle, CapRights::GRANT)?;
        if !parent.rights.contains(child_rights) {
            return Err(CapError::PermissionDenied);
        }
        Ok(self.insert_with_parent(parent.kind, parent.object, child_rights, handle.index()))
    }

    /// Free a single capability. Fails if it still has derived children —
    /// use `revoke` to tear down a subtree.
    pub fn remove(&self, handle: Handle) -> Result<(), CapError> {
        let mut inner = self.inner.lock();
        let entry = inner.resolve(handle)?;
        if entry.first_child != CAP_NO_PARENT {
            return Err(CapError::HasChildren);
        }
        let parent = entry.parent;
        self.unlink_from_parent(&mut inner, handle.index(), parent);
        self.free_slot(&mut inner, handle.index());
        Ok(())
    }

    /// Cascading DFS removal of `handle` and every capability derived from
    /// it, direct or transitive.
    pub fn revoke(&self, handle: Handle) -> Result<(), CapError> {
        let mut inner = self.inner.lock();
        inner.resolve(handle)?;

        let parent = match &inner.slots[handle.index() as usize] {
            Slot::Used(e) => e.parent,
            Slot::Free { .. } => return Err(CapError::InvalidHandle),
        };
        self.unlink_from_parent(&mut inner, handle.index(), parent);

        let mut stack: Vec<u32> = alloc::vec![handle.index()];
        while let Some(idx) = stack.pop() {
            if let Slot::Used(entry) = &inner.slots[idx as usize] {
                let mut child = entry.first_child;
                while child != CAP_NO_PARENT {
                    let next_sibling = match &inner.slots[child as usize] {
                        Slot::Used(c) => c.next_sibling,
                        Slot::Free { .. } => CAP_NO_PARENT,
                    };
                    stack.push(child);
                    child = next_sibling;
                }
            }
            self.free_slot(&mut inner, idx);
        }
        Ok(())
    }

    fn unlink_from_parent(&self, inner: &mut CapTableInner, idx: u32, parent: u32) {
        if parent == CAP_NO_PARENT {
            return;
        }
        let Some(Slot::Used(parent_entry)) = inner.slots.get_mut(parent as usize) else {
            return;
        };
        if parent_entry.first_child == idx {
            let next = match &inner.slots[idx as usize] {
                Slot::Used(e) => e.next_sibling,
                Slot::Free { .. } => CAP_NO_PARENT,
            };
            if let Some(Slot::Used(parent_entry)) = inner.slots.get_mut(parent as usize) {
                parent_entry.first_child = next;
            }
            return;
        }
        let mut cur = parent_entry.first_child;
        while cur != CAP_NO_PARENT {
            let next = match &inner.slots[cur as usize] {
                Slot::Used(e) => e.next_sibling,
                Slot::Free { .. } => CAP_NO_PARENT,
            };
            if next == idx {
                let grandchild_next = match &inner.slots[idx as usize] {
                    Slot::Used(e) => e.next_sibling,
                    Slot::Free { .. } => CAP_NO_PARENT,
                };
                if let Slot::Used(e) = &mut inner.slots[cur as usize] {
                    e.next_sibling = grandchild_next;
                }
                return;
            }
            cur = next;
        }
    }

    fn free_slot(&self, inner: &mut CapTableInner, idx: u32) {
        let generation = match &inner.slots[idx as usize] {
            Slot::Used(entry) => {
                inner.live -= 1;
                entry.generation
            }
            Slot::Free { generation, .. } => *generation,
        };
        inner.slots[idx as usize] = Slot::Free {
            next: inner.free_head,
            generation,
        };
        inner.free_head = idx;
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live
    }
}

unsafe impl Send for CapTable {}
unsafe impl Sync for CapTable {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_roundtrip() {
        let table = CapTable::new();
        let h = table.insert(ObjectKind::Memory, 0x1000, CapRights::READ | CapRights::WRITE);
        let entry = table.get(h).expect("present");
        assert_eq!(entry.object, 0x1000);
        assert!(entry.rights.contains(CapRights::READ));
    }

    #[test]
    fn stale_handle_after_remove_is_rejected() {
        let table = CapTable::new();
        let h = table.insert(ObjectKind::Channel, 7, CapRights::READ);
        table.remove(h).unwrap();
        assert_eq!(table.get_checked(h), Err(CapError::StaleGeneration));
    }

    #[test]
    fn derive_requires_subset_rights_and_grant() {
        let table = CapTable::new();
        let parent = table.insert(ObjectKind::Channel, 1, CapRights::READ | CapRights::WRITE);
        assert_eq!(
            table.derive(parent, CapRights::READ),
            Err(CapError::PermissionDenied)
        );

        let grantable = table.insert(
            ObjectKind::Channel,
            2,
            CapRights::READ | CapRights::WRITE | CapRights::GRANT,
        );
        let child = table.derive(grantable, CapRights::READ).unwrap();
        assert!(table.get(child).unwrap().rights.contains(CapRights::READ));
        assert!(!table.get(child).unwrap().rights.contains(CapRights::WRITE));

        assert_eq!(
            table.derive(grantable, CapRights::EXEC),
            Err(CapError::PermissionDenied)
        );
    }

    #[test]
    fn remove_fails_with_live_children() {
        let table = CapTable::new();
        let parent = table.insert(ObjectKind::Channel, 1, CapRights::GRANT | CapRights::READ);
        let _child = table.derive(parent, CapRights::READ).unwrap();
        assert_eq!(table.remove(parent), Err(CapError::HasChildren));
    }

    #[test]
    fn revoke_cascades_to_grandchildren() {
        let table = CapTable::new();
        let root = table.insert(
            ObjectKind::Channel,
            1,
            CapRights::READ | CapRights::WRITE | CapRights::GRANT,
        );
        let mid = table.derive(root, CapRights::READ | CapRights::GRANT).unwrap();
        let leaf = table.derive(mid, CapRights::READ).unwrap();

        assert_eq!(table.live_count(), 3);
        table.revoke(root).unwrap();
        assert_eq!(table.live_count(), 0);
        assert!(table.get(mid).is_none());
        assert!(table.get(leaf).is_none());
    }

    #[test]
    fn insert_bounded_masks_rights_to_bounding_set() {
        let table = CapTable::new();
        let bounding = CapRights::READ | CapRights::WRITE;
        let h = table
            .insert_bounded(ObjectKind::Memory, 0x2000, CapRights::all(), bounding)
            .unwrap();
        let entry = table.get(h).unwrap();
        assert!(entry.rights.contains(CapRights::READ));
        assert!(entry.rights.contains(CapRights::WRITE));
        assert!(!entry.rights.contains(CapRights::GRANT));
        assert!(!entry.rights.contains(CapRights::REVOKE));
    }

    #[test]
    fn insert_bounded_rejects_past_capacity() {
        let table = CapTable::new();
        for i in 0..MAX_CAPS_PER_TABLE {
            table
                .insert_bounded(ObjectKind::Memory, i as u64, CapRights::READ, CapRights::all())
                .unwrap();
        }
        assert_eq!(
            table.insert_bounded(ObjectKind::Memory, 999, CapRights::READ, CapRights::all()),
            Err(CapError::TableFull)
        );
    }

    #[test]
    fn generation_increments_on_slot_reuse() {
        let table = CapTable::new();
        let h1 = table.insert(ObjectKind::File, 1, CapRights::READ);
        table.remove(h1).unwrap();
        let h2 = table.insert(ObjectKind::File, 2, CapRights::READ);
        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1.generation(), h2.generation());
    }
}

//! Priority-inheritance mutex (spec §4.10): a spinning lock whose owner's
//! effective priority is temporarily raised to match the highest-priority
//! waiter, so a low-priority task holding the lock can't be starved behind
//! medium-priority tasks while a high-priority task blocks on it (the
//! classic priority-inversion bug). The boost chain walk is capped at
//! `PI_MAX_CHAIN_DEPTH` hops, matching how `cap::table::revoke`'s subtree
//! walk is bounded by the table size rather than recursing unboundedly.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crate::config::PI_MAX_CHAIN_DEPTH;
use crate::sched::SCHEDULER;

const NO_OWNER: isize = -1;

/// A mutex that boosts its owner's priority to the best waiter's while
/// contended, and restores the owner's base priority on release.
pub struct PiMutex<T> {
    owner: AtomicIsize,
    waiters: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for PiMutex<T> {}
unsafe impl<T: Send> Sync for PiMutex<T> {}

impl<T> PiMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicIsize::new(NO_OWNER),
            waiters: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Spin until `waiter_id`'s task acquires the lock, boosting the
    /// current owner's priority along the way.
    pub fn lock(&self, waiter_id: usize) -> PiMutexGuard<'_, T> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        loop {
            match self
                .owner
                .compare_exchange(NO_OWNER, waiter_id as isize, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(owner) => {
                    if owner >= 0 {
                        set_blocked_on(waiter_id, owner as usize);
                        boost_chain(owner as usize, waiter_id);
                    }
                    core::hint::spin_loop();
                }
            }
        }
        clear_blocked_on(waiter_id);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        PiMutexGuard { mutex: self }
    }

    fn unlock(&self) {
        let owner = self.owner.swap(NO_OWNER, Ordering::Release);
        if owner >= 0 {
            restore_prio(owner as usize);
        }
    }
}

pub struct PiMutexGuard<'a, T> {
    mutex: &'a PiMutex<T>,
}

impl<'a, T> Deref for PiMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for PiMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for PiMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Raise `owner_id`'s effective priority to at least `waiter_id`'s, then
/// follow `owner_id`'s own `blocked_on` link (set by `lock` whenever a task
/// is itself spinning on another `PiMutex`) up to `PI_MAX_CHAIN_DEPTH` hops,
/// boosting each link in turn. This is the transitive-boost half of
/// priority inheritance: without walking past the first hop, a chain of
/// three or more tasks each waiting on the next can still starve the
/// highest priority one.
fn boost_chain(owner_id: usize, waiter_id: usize) {
    let mut guard = SCHEDULER.lock();
    let Some(sched) = guard.as_mut() else { return };

    let Some(waiter_prio) = sched.task(waiter_id).map(|t| t.effective_prio()) else {
        return;
    };

    let mut current = owner_id;
    for _ in 0..PI_MAX_CHAIN_DEPTH {
        let Some(task) = sched.task_mut(current) else {
            return;
        };
        if task.effective_prio() <= waiter_prio {
            return; // already at least as urgent; no need to propagate further
        }
        task.boosted_prio = Some(waiter_prio);

        match task.blocked_on {
            Some(next) => current = next,
            None => return,
        }
    }
}

fn restore_prio(owner_id: usize) {
    let mut guard = SCHEDULER.lock();
    if let Some(sched) = guard.as_mut() {
        if let Some(task) = sched.task_mut(owner_id) {
            task.boosted_prio = None;
        }
    }
}

fn set_blocked_on(waiter_id: usize, owner_id: usize) {
    let mut guard = SCHEDULER.lock();
    if let Some(sched) = guard.as_mut() {
        if let Some(task) = sched.task_mut(waiter_id) {
            task.blocked_on = Some(owner_id);
        }
    }
}

fn clear_blocked_on(waiter_id: usize) {
    let mut guard = SCHEDULER.lock();
    if let Some(sched) = guard.as_mut() {
        if let Some(task) = sched.task_mut(waiter_id) {
            task.blocked_on = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip_single_threaded() {
        let m = PiMutex::new(0u32);
        {
            let mut guard = m.lock(1);
            *guard = 42;
        }
        let guard = m.lock(1);
        assert_eq!(*guard, 42);
    }

    extern "C" fn dummy_entry() -> ! {
        loop {}
    }

    #[test]
    fn boost_chain_propagates_past_first_hop() {
        crate::sched::init();
        let a = crate::sched::spawn_other(dummy_entry, 200).unwrap();
        let b = crate::sched::spawn_other(dummy_entry, 150).unwrap();
        let c = crate::sched::spawn_other(dummy_entry, 10).unwrap();

        // b is itself blocked on a (as if b is spinning on a PiMutex a owns).
        {
            let mut guard = SCHEDULER.lock();
            let sched = guard.as_mut().unwrap();
            sched.task_mut(b).unwrap().blocked_on = Some(a);
        }

        // c now blocks on a lock owned by b.
        boost_chain(b, c);

        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut().unwrap();
        assert_eq!(sched.task(b).unwrap().boosted_prio, Some(10));
        assert_eq!(
            sched.task(a).unwrap().boosted_prio,
            Some(10),
            "boost did not propagate past the first hop in the chain"
        );
    }
}

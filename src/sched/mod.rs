//! Preemptive, multi-policy scheduling (spec §4.10): the context-switch
//! trampoline and per-task bookkeeping are the teacher's `threading.rs`
//! carried over verbatim; `scheduler::pick_next` replaces its flat
//! round-robin with SCHED_OTHER + SCHED_DEADLINE (EDF) policy selection,
//! and `pi` adds bounded-depth priority inheritance for in-kernel locks.

pub mod deadline;
pub mod pi;
pub mod scheduler;

use core::arch::global_asm;
use spinning_top::Spinlock;

use crate::config::{DEFAULT_THREAD_STACK_SIZE, MAX_THREADS, PRIO_DEFAULT};
use deadline::DeadlineParams;

global_asm!(
    r#"
.section .text
.global switch_context
.global thread_start

// void switch_context(Context* old, const Context* new)
switch_context:
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x30, [x0, #80]

    mov x9, sp
    str x9, [x0, #96]

    mrs x9, daif
    str x9, [x0, #104]

    ldp x19, x20, [x1, #0]
    ldp x21, x22, [x1, #16]
    ldp x23, x24, [x1, #32]
    ldp x25, x26, [x1, #48]
    ldp x27, x28, [x1, #64]
    ldp x29, x30, [x1, #80]

    ldr x9, [x1, #96]
    mov sp, x9

    ldr x9, [x1, #104]
    msr daif, x9

    ret

thread_start:
    msr daifclr, #2
    blr x19
1:  wfi
    b 1b
"#
);

unsafe extern "C" {
    fn switch_context(old: *mut Context, new: *const Context);
    fn thread_start() -> !;
}

/// CPU context saved across a switch; layout matches the assembly above.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub x29: u64,
    pub x30: u64,
    pub sp: u64,
    pub daif: u64,
}

impl Context {
    pub const fn zero() -> Self {
        Self {
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            x29: 0,
            x30: 0,
            sp: 0,
            daif: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Other,
    Deadline,
}

pub struct Task {
    pub id: usize,
    pub context: Context,
    pub stack_ptr: usize,
    pub stack_size: usize,
    pub state: TaskState,
    pub policy: SchedPolicy,
    /// SCHED_OTHER base priority; lower value wins. May be transiently
    /// raised by `pi::boost` while this task holds a contended `PiMutex`.
    pub base_prio: u8,
    pub boosted_prio: Option<u8>,
    pub deadline: Option<DeadlineParams>,
    /// Address of the `PiMutex` this task is spinning on, if any — the
    /// link `pi::boost_chain` follows to propagate a priority boost.
    pub blocked_on: Option<usize>,
}

impl Task {
    pub fn effective_prio(&self) -> u8 {
        self.boosted_prio.unwrap_or(self.base_prio).min(self.base_prio)
    }

    fn new(id: usize, entry: extern "C" fn() -> !, stack_size: usize) -> Self {
        use alloc::alloc::{alloc_zeroed, Layout};

        let layout = Layout::from_size_align(stack_size, 16).unwrap();
        let stack_ptr = unsafe { alloc_zeroed(layout) as usize };
        if stack_ptr == 0 {
            panic!("failed to allocate task stack");
        }
        let stack_top = stack_ptr + stack_size;
        let sp = (stack_top & !0xF) as u64;

        let mut context = Context::zero();
        context.sp = sp;
        context.x19 = entry as *const () as u64;
        context.x30 = thread_start as *const () as u64;

        Self {
            id,
            context,
            stack_ptr,
            stack_size,
            state: TaskState::Ready,
            policy: SchedPolicy::Other,
            base_prio: PRIO_DEFAULT,
            boosted_prio: None,
            deadline: None,
            blocked_on: None,
        }
    }

    fn new_idle() -> Self {
        Self {
            id: 0,
            context: Context::zero(),
            stack_ptr: 0,
            stack_size: 0,
            state: TaskState::Running,
            policy: SchedPolicy::Other,
            base_prio: PRIO_DEFAULT,
            boosted_prio: None,
            deadline: None,
            blocked_on: None,
        }
    }
}

pub static SCHEDULER: Spinlock<Option<scheduler::Scheduler>> = Spinlock::new(None);

pub fn init() {
    let mut sched = SCHEDULER.lock();
    *sched = Some(scheduler::Scheduler::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    TooManyTasks,
    BandwidthExceeded,
}

pub fn spawn_other(entry: extern "C" fn() -> !, prio: u8) -> Result<usize, SpawnError> {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().ok_or(SpawnError::TooManyTasks)?;
    let mut task = Task::new(sched.next_id(), entry, DEFAULT_THREAD_STACK_SIZE);
    task.base_prio = prio;
    sched.add(task)
}

/// Task id of whatever is running on this CPU right now, if the
/// scheduler has been initialized.
pub fn current_task_id() -> Option<usize> {
    SCHEDULER.lock().as_ref().map(|s| s.current_task_id())
}

pub fn spawn_deadline(
    entry: extern "C" fn() -> !,
    params: DeadlineParams,
) -> Result<usize, SpawnError> {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().ok_or(SpawnError::TooManyTasks)?;
    sched.admit_deadline_bandwidth(&params)?;
    let mut task = Task::new(sched.next_id(), entry, DEFAULT_THREAD_STACK_SIZE);
    task.policy = SchedPolicy::Deadline;
    task.deadline = Some(params);
    sched.add(task)
}

/// Timer/SGI-driven preemption point: the only place a context switch
/// actually happens.
pub fn tick(irq: u32, now_us: u64) {
    crate::gic::end_of_interrupt(irq);

    let (switch_info, sched_ptr) = {
        let mut guard = SCHEDULER.lock();
        match guard.as_mut() {
            Some(sched) => {
                let ptr = sched as *mut scheduler::Scheduler;
                (sched.pick_next(now_us), Some(ptr))
            }
            None => (None, None),
        }
    };

    if let (Some((old_idx, new_idx)), Some(sched_ptr)) = (switch_info, sched_ptr) {
        unsafe {
            let sched = &mut *sched_ptr;
            let (old_ptr, new_ptr) = sched.context_ptrs(old_idx, new_idx);
            switch_context(old_ptr, new_ptr);
        }
    }
}

extern "C" fn thread_exit() -> ! {
    {
        let mut guard = SCHEDULER.lock();
        if let Some(sched) = guard.as_mut() {
            sched.mark_current_terminated();
        }
    }
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_prio_prefers_boost_only_if_higher() {
        let mut t = Task::new_idle();
        t.base_prio = 120;
        assert_eq!(t.effective_prio(), 120);
        t.boosted_prio = Some(10);
        assert_eq!(t.effective_prio(), 10);
        t.boosted_prio = Some(200); // a "boost" that's actually lower prio is ignored
        assert_eq!(t.effective_prio(), 120);
    }
}

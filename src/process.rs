//! The Viper process model (spec §4.11/§3): id/name/state, an owned
//! address space, a capability table, the set of scheduler task ids that
//! belong to it, a parent/sibling link for the process tree, a heap
//! break, and its VMA list. Processes are tracked in a global table the
//! same way the teacher's thread/channel registries use a
//! `Spinlock<BTreeMap<..>>` keyed by id.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spinning_top::Spinlock;

use crate::cap::{CapRights, CapTable};
use crate::config::USER_PROC_STACK_SIZE;
use crate::loader::{self, ElfError};
use crate::vmm::address_space::AddressSpace;
use crate::vmm::vma::{Prot, VmaKind, VmaList};

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Zombie(i32),
}

/// A process's memory bookkeeping: where the heap break currently sits
/// and the bounds of its mapped stack, kept separately from the VMA list
/// since `brk` moves incrementally rather than through insert/remove.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pub code_end: usize,
    pub brk: usize,
    pub stack_bottom: usize,
    pub stack_top: usize,
}

impl ProcessMemory {
    pub fn new(code_end: usize, stack_bottom: usize, stack_top: usize) -> Self {
        Self {
            code_end,
            brk: code_end,
            stack_bottom,
            stack_top,
        }
    }
}

pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,

    pub address_space: AddressSpace,
    pub memory: ProcessMemory,
    pub vmas: VmaList,

    pub caps: CapTable,
    /// Mask ANDed into every `insert_bounded` request from this process;
    /// narrows but never widens what `exec`/future syscalls might set.
    pub cap_bounding_set: CapRights,

    /// Scheduler task ids belonging to this process; index 0 is the main
    /// thread created at spawn.
    pub tasks: Vec<usize>,

    /// Entry point and initial user stack pointer the main thread's
    /// trampoline reads on its first (and only) dispatch into EL0.
    pub entry_point: usize,
    pub initial_sp: usize,
}

impl Process {
    fn new(
        pid: Pid,
        name: String,
        parent: Option<Pid>,
        address_space: AddressSpace,
        memory: ProcessMemory,
        entry_point: usize,
        initial_sp: usize,
    ) -> Self {
        Self {
            pid,
            name,
            state: ProcessState::Ready,
            parent,
            children: Vec::new(),
            address_space,
            memory,
            vmas: VmaList::new(),
            caps: CapTable::new(),
            cap_bounding_set: CapRights::all(),
            tasks: Vec::new(),
            entry_point,
            initial_sp,
        }
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state, ProcessState::Zombie(_))
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.address_space.destroy();
    }
}

static PROCESSES: Spinlock<BTreeMap<Pid, Box<Process>>> = Spinlock::new(BTreeMap::new());
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Scheduler task id -> owning pid. Task ids and pids are independent
/// counters (the scheduler's task table and the process table are
/// separate allocators), so this is the only place that maps one to the
/// other; `syscall::current_pid` and the user-entry trampoline both go
/// through it rather than assuming the two id spaces coincide.
static TASK_PID: Spinlock<BTreeMap<usize, Pid>> = Spinlock::new(BTreeMap::new());

pub fn allocate_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Record that scheduler task `task_id` belongs to `pid`, and that `pid`
/// owns it (pushed onto `Process::tasks`).
pub fn bind_task(task_id: usize, pid: Pid) {
    crate::irq::with_irqs_disabled(|| {
        TASK_PID.lock().insert(task_id, pid);
    });
    if let Some(p) = lookup_process(pid) {
        p.tasks.push(task_id);
    }
}

pub fn pid_for_task(task_id: usize) -> Option<Pid> {
    crate::irq::with_irqs_disabled(|| TASK_PID.lock().get(&task_id).copied())
}

fn unbind_tasks_for(pid: Pid, task_ids: &[usize]) {
    crate::irq::with_irqs_disabled(|| {
        let mut map = TASK_PID.lock();
        for id in task_ids {
            if map.get(id) == Some(&pid) {
                map.remove(id);
            }
        }
    });
}

pub fn register_process(proc: Box<Process>) {
    crate::irq::with_irqs_disabled(|| {
        PROCESSES.lock().insert(proc.pid, proc);
    })
}

pub fn lookup_process(pid: Pid) -> Option<&'static mut Process> {
    crate::irq::with_irqs_disabled(|| {
        PROCESSES
            .lock()
            .get_mut(&pid)
            .map(|p| unsafe { &mut *(p.as_mut() as *mut Process) })
    })
}

pub fn remove_process(pid: Pid) -> Option<Box<Process>> {
    let removed = crate::irq::with_irqs_disabled(|| PROCESSES.lock().remove(&pid));
    if let Some(proc) = &removed {
        unbind_tasks_for(pid, &proc.tasks);
    }
    removed
}

#[derive(Debug)]
pub enum SpawnError {
    Elf(ElfError),
    TooManyTasks,
}

impl From<ElfError> for SpawnError {
    fn from(e: ElfError) -> Self {
        SpawnError::Elf(e)
    }
}

/// Loads `elf_data`, builds its address space, registers its stack and
/// a guard page as VMAs, installs the process in the global table, and
/// spawns its main thread (`user_entry_trampoline`, bound to this pid)
/// so the scheduler actually dispatches into the loaded image.
pub fn spawn_process(name: &str, elf_data: &[u8], parent: Option<Pid>) -> Result<Pid, SpawnError> {
    let (entry_point, address_space, initial_sp, brk) =
        loader::load_elf_with_stack(elf_data, USER_PROC_STACK_SIZE)?;

    let stack_top = crate::config::USER_STACK_TOP;
    let stack_bottom = stack_top - USER_PROC_STACK_SIZE;

    let pid = allocate_pid();
    let mut process = Box::new(Process::new(
        pid,
        String::from(name),
        parent,
        address_space,
        ProcessMemory::new(brk, stack_bottom, stack_top),
        entry_point,
        initial_sp,
    ));

    process
        .vmas
        .insert(stack_bottom, stack_top, Prot::READ | Prot::WRITE, VmaKind::Stack)
        .ok();

    if let Some(parent_pid) = parent {
        if let Some(p) = lookup_process(parent_pid) {
            p.children.push(pid);
        }
    }

    register_process(process);

    let task_id = crate::sched::spawn_other(user_entry_trampoline, crate::config::PRIO_DEFAULT)
        .map_err(|_| SpawnError::TooManyTasks)?;
    bind_task(task_id, pid);

    Ok(pid)
}

/// The main thread of every freshly spawned process starts here: it has
/// nothing but a kernel stack and its own task id. It looks up the
/// process that owns it, activates that process's address space, and
/// drops into EL0 at the loaded entry point.
extern "C" fn user_entry_trampoline() -> ! {
    let task_id = crate::sched::current_task_id().expect("running with no scheduler");
    let pid = pid_for_task(task_id).expect("user thread with no owning process");
    let process = lookup_process(pid).expect("owning process vanished before first dispatch");

    let table_phys = process.address_space.table_phys();
    let asid = process.address_space.asid();
    let entry = process.entry_point as u64;
    let sp = process.initial_sp as u64;

    crate::mmu::switch_address_space(table_phys, asid);

    unsafe {
        core::arch::asm!(
            "msr sp_el0, {sp}",
            "msr elr_el1, {entry}",
            "msr spsr_el1, {spsr}",
            "eret",
            sp = in(reg) sp,
            entry = in(reg) entry,
            spsr = in(reg) 0u64,
            options(noreturn),
        );
    }
}

/// Tears down `pid`'s address space and capability table and replaces it
/// with a freshly loaded image, keeping the same pid and parent — the
/// `exec()` half of the process model. Fails closed: on load error the
/// original process is left untouched.
pub fn replace_process(pid: Pid, elf_data: &[u8]) -> Result<(), SpawnError> {
    let (entry_point, new_space, initial_sp, brk) =
        loader::load_elf_with_stack(elf_data, USER_PROC_STACK_SIZE)?;

    let Some(process) = lookup_process(pid) else {
        return Err(SpawnError::Elf(ElfError::AddressSpaceFailed));
    };

    let stack_top = crate::config::USER_STACK_TOP;
    let stack_bottom = stack_top - USER_PROC_STACK_SIZE;

    process.address_space.destroy();
    process.address_space = new_space;
    process.memory = ProcessMemory::new(brk, stack_bottom, stack_top);
    process.vmas = VmaList::new();
    process.caps = CapTable::new();
    process.cap_bounding_set = CapRights::all();
    process.entry_point = entry_point;
    process.initial_sp = initial_sp;
    process
        .vmas
        .insert(stack_bottom, stack_top, Prot::READ | Prot::WRITE, VmaKind::Stack)
        .ok();

    Ok(())
}

pub fn kill_process(pid: Pid, exit_code: i32) -> Result<(), &'static str> {
    let Some(process) = lookup_process(pid) else {
        return Err("no such process");
    };
    process.state = ProcessState::Zombie(exit_code);
    Ok(())
}

pub fn waitpid(pid: Pid) -> Option<i32> {
    let process = lookup_process(pid)?;
    match process.state {
        ProcessState::Zombie(code) => {
            remove_process(pid);
            Some(code)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_allocation_is_monotonic() {
        let a = allocate_pid();
        let b = allocate_pid();
        assert!(b > a);
    }

    #[test]
    fn task_pid_map_is_independent_of_task_id_value() {
        // A task id equal to some unrelated pid must not resolve to that
        // pid without an explicit bind_task call.
        assert_eq!(pid_for_task(7), None);

        let pid = allocate_pid();
        bind_task(7, pid);
        assert_eq!(pid_for_task(7), Some(pid));

        unbind_tasks_for(pid, &[7]);
        assert_eq!(pid_for_task(7), None);
    }
}

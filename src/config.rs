//! Kernel configuration constants
//!
//! This module contains tunable parameters for the kernel.
//! Modify these values to adjust kernel behavior.
//!
//! # Stack Size Warnings
//!
//! Stack sizes may be insufficient for certain workloads:
//! - Deep async call chains (SSH, HTTP) may need larger stacks
//! - Recursive algorithms can overflow smaller stacks
//! - Complex shell commands may need more stack space
//!
//! See `docs/THREAD_STACK_ANALYSIS.md` for detailed analysis and guidance.

#![allow(dead_code)]

/// Boot/kernel stack size (1MB default)
///
/// Used by thread 0 (boot thread) and exception handlers.
/// This stack is placed at a fixed address (0x42000000) in boot.rs.
pub const KERNEL_STACK_SIZE: usize = 1024 * 1024;

/// Default per-thread stack size (32KB)
///
/// Used for kernel threads spawned without a custom stack size.
/// WARNING: May overflow with deep async polling or recursion.
/// Consider using `ASYNC_THREAD_STACK_SIZE` for network-heavy threads.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 32 * 1024;

/// Stack size for networking/async thread (256KB)
///
/// Larger stack to handle deep SSH/HTTP async call chains.
/// Use this for threads that run the async executor or network services.
pub const ASYNC_THREAD_STACK_SIZE: usize = 256 * 1024;

/// User process stack size (64KB default)
///
/// Stack allocated for user-space ELF processes.
/// WARNING: May overflow with deep recursion in user code.
/// A guard page is placed below the stack to detect overflow.
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// Maximum kernel threads
///
/// Total number of thread slots in the thread pool.
/// Thread 0 is reserved for the boot/idle thread.
/// Actual usable threads = MAX_THREADS - 1
pub const MAX_THREADS: usize = 32;

/// Enable stack canary checking
///
/// When enabled, canary values are written at the bottom of each thread stack
/// and periodically checked to detect stack overflow.
/// Disable for slightly better performance in production.
pub const ENABLE_STACK_CANARIES: bool = true;

/// Stack canary value
///
/// Magic value written at the bottom of each stack.
/// If this value is corrupted, stack overflow has occurred.
pub const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Number of canary words at stack bottom
///
/// More canary words = better detection but more wasted stack space.
/// 8 words = 64 bytes of canary.
pub const CANARY_WORDS: usize = 8;

// ============================================================================
// Memory layout
// ============================================================================

/// Page size used throughout the memory subsystem (4 KiB).
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Maximum buddy order. Order `k` covers `2^k` pages, so `MAX_ORDER - 1`
/// is the largest contiguous run the buddy allocator will hand out.
pub const MAX_ORDER: usize = 11; // up to 2^10 pages = 4MB runs

/// Size of the PMM's low, bitmap-tracked region (kernel image + bitmap
/// storage + small tail), counted from the base of RAM. Everything above
/// this boundary — the framebuffer reservation and beyond — is handed to
/// the buddy allocator instead.
pub const PMM_LOW_REGION_SIZE: usize = 16 * 1024 * 1024;

/// Kernel heap size classes (bytes), from §4.3: nine classes, the last
/// being the catch-all "large" class serviced straight from the PMM.
pub const HEAP_SIZE_CLASSES: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Kernel heap header alignment and minimum block size.
pub const HEAP_ALIGNMENT: usize = 16;

/// Per-CPU arena class cutoff: classes at or below this index (inclusive)
/// get a per-CPU cache. Classes 0..=5 are the <=1024B classes.
pub const HEAP_PERCPU_CLASS_CUTOFF: usize = 5;

/// Per-CPU cache capacity per size class.
pub const HEAP_PERCPU_CACHE_CAP: usize = 8;

/// Kernel heap cannot expand past this bound.
pub const MAX_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Threshold below which the coalescing pass does a full address-sorted
/// single-pass merge; above it, falls back to per-class pairwise merging.
pub const HEAP_COALESCE_SORT_THRESHOLD: usize = 256;

/// Number of logical CPUs the per-CPU structures are sized for. Best-effort
/// SMP only (see Non-goals) — on a UP boot this degenerates to CPU 0.
pub const MAX_CPUS: usize = 4;

/// Maximum number of VMAs tracked per process.
pub const MAX_VMAS_PER_PROCESS: usize = 64;

/// Maximum growth of a STACK-type VMA.
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Swap: fixed slot count, 4KiB per slot => 64MiB max swap.
pub const SWAP_SLOT_COUNT: usize = 16384;

/// Number of allocatable ASIDs (ASID 0 reserved for the kernel).
pub const MAX_ASID: u16 = 256;

// ============================================================================
// Scheduler
// ============================================================================

/// Default ("don't care") priority; lower numeric value = higher priority.
pub const PRIO_DEFAULT: u8 = 120;
pub const PRIO_MIN: u8 = 0;
pub const PRIO_MAX: u8 = 255;

/// EDF admission control cap, parts-per-thousand.
pub const DEADLINE_BANDWIDTH_CAP_PPT: u64 = 950;

/// Consecutive deadline misses before DEMOTE_ON_MISS kicks in.
pub const DEADLINE_MISS_DEMOTE_THRESHOLD: u32 = 3;

/// Bound on the priority-inheritance chain walk.
pub const PI_MAX_CHAIN_DEPTH: usize = 8;

// ============================================================================
// Capability table
// ============================================================================

/// Sentinel marking the end of the capability table's free-slot chain.
pub const CAP_FREELIST_END: u32 = 0xFFFF_FFFF;

/// Sentinel `parent_index` for root (non-derived) capabilities.
pub const CAP_NO_PARENT: u32 = 0xFFFF_FFFF;

/// Upper bound on live entries in a single process's capability table.
pub const MAX_CAPS_PER_TABLE: usize = 256;

// ============================================================================
// Bytecode VM
// ============================================================================

/// Module wire-format magic: "VBC\x01" read little-endian.
pub const BYTECODE_MAGIC: u32 = 0x0143_4256;
pub const BYTECODE_VERSION: u32 = 1;

pub const VM_MAX_CALL_DEPTH: usize = 256;
pub const VM_MAX_STACK_SIZE: usize = 256; // slots per frame's operand budget
pub const VM_ALLOCA_BUFFER_CAP: usize = 1024 * 1024;

// ============================================================================
// User process virtual address layout
// ============================================================================

pub const USER_CODE_BASE: usize = 0x0000_0000_0040_0000;
pub const USER_HEAP_BASE: usize = 0x0000_0000_1000_0000;
pub const USER_STACK_TOP: usize = 0x0000_0000_3FFF_F000;
pub const USER_PROC_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Kernel higher-half base; translations for it are reserved but TTBR1
/// relocation is not wired up yet (kernel still runs low-half, see mmu.rs).
pub const KERNEL_HIGHER_HALF_BASE: usize = 0xFFFF_0000_0000_0000;


//! MMU (Memory Management Unit) for AArch64
//!
//! Implements page table management for virtual memory.
//! Uses 4KB granule with 4-level page tables (L0-L3).
//!
//! Memory layout:
//! - TTBR0_EL1: User space (0x0000_0000_0000_0000 - 0x0000_FFFF_FFFF_FFFF)
//! - TTBR1_EL1: Kernel space (0xFFFF_0000_0000_0000 - 0xFFFF_FFFF_FFFF_FFFF)
//!
//! For simplicity, we use identity mapping for the kernel with 1GB blocks.

#![allow(dead_code)]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, Ordering};

/// Page size: 4KB
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Page table entry count per level
pub const ENTRIES_PER_TABLE: usize = 512;

/// Virtual address bits per level
pub const BITS_PER_LEVEL: usize = 9;

/// Memory attribute indices (configured in MAIR_EL1)
pub const MAIR_DEVICE_NGNRNE: u64 = 0; // Device memory, non-Gathering, non-Reordering, non-Early Write Acknowledgement
pub const MAIR_NORMAL_NC: u64 = 1; // Normal memory, non-cacheable
pub const MAIR_NORMAL_WT: u64 = 2; // Normal memory, write-through
pub const MAIR_NORMAL_WB: u64 = 3; // Normal memory, write-back

/// Page table entry flags
pub mod flags {
    /// Entry is valid
    pub const VALID: u64 = 1 << 0;
    /// Table descriptor (vs block descriptor)
    pub const TABLE: u64 = 1 << 1;
    /// Block descriptor for L1/L2 (1GB/2MB blocks)
    pub const BLOCK: u64 = 0 << 1;
    /// Access flag (must be set or access fault)
    pub const AF: u64 = 1 << 10;
    /// Shareability: Inner shareable
    pub const SH_INNER: u64 = 3 << 8;
    /// Shareability: Outer shareable
    pub const SH_OUTER: u64 = 2 << 8;
    /// AP[2:1] - Access permissions
    pub const AP_RW_EL1: u64 = 0 << 6; // R/W at EL1, no access at EL0
    pub const AP_RW_ALL: u64 = 1 << 6; // R/W at EL1 and EL0
    pub const AP_RO_EL1: u64 = 2 << 6; // R/O at EL1, no access at EL0
    pub const AP_RO_ALL: u64 = 3 << 6; // R/O at EL1 and EL0
    /// User accessible (EL0)
    pub const USER: u64 = 1 << 6;
    /// Execute never at EL1
    pub const PXN: u64 = 1 << 53;
    /// Execute never at EL0
    pub const UXN: u64 = 1 << 54;
    /// Non-global (uses ASID)
    pub const NG: u64 = 1 << 11;
}

/// Memory attribute index in entry (bits 4:2)
#[inline]
pub const fn attr_index(idx: u64) -> u64 {
    (idx & 0x7) << 2
}

/// 1GB block size
pub const BLOCK_1GB: usize = 1 << 30;
/// 2MB block size
pub const BLOCK_2MB: usize = 1 << 21;

/// Kernel page tables (L0, L1) - statically allocated
/// We use 1GB blocks at L1 level for kernel identity mapping
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u64; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [0; ENTRIES_PER_TABLE],
        }
    }
}

/// Static kernel page tables
/// L0 table (top level, covers 512GB per entry)
static mut KERNEL_L0: PageTable = PageTable::new();
/// L1 table (second level, covers 1GB per entry as blocks)
static mut KERNEL_L1: PageTable = PageTable::new();

/// MMU initialization state
static MMU_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Check if MMU is initialized
pub fn is_initialized() -> bool {
    MMU_INITIALIZED.load(Ordering::Acquire)
}

/// Initialize MMU with identity mapping for kernel
///
/// This sets up:
/// - MAIR_EL1: Memory attribute configuration
/// - TCR_EL1: Translation control register
/// - TTBR1_EL1: Kernel page tables (identity mapped)
/// - TTBR0_EL1: Initially zero (no user space)
/// - SCTLR_EL1: Enable MMU
///
/// # Arguments
/// * `ram_base` - Physical base address of RAM
/// * `ram_size` - Size of RAM in bytes
pub fn init(ram_base: usize, ram_size: usize) {
    // Build kernel page tables before enabling MMU
    unsafe {
        build_kernel_page_tables(ram_base, ram_size);
    }

    // Get page table physical addresses
    let l0_addr = unsafe { addr_of_mut!(KERNEL_L0) as u64 };

    unsafe {
        // Configure MAIR_EL1 (Memory Attribute Indirection Register)
        // Attr0: Device-nGnRnE (0x00)
        // Attr1: Normal, Non-cacheable (0x44)
        // Attr2: Normal, Write-through (0xBB)
        // Attr3: Normal, Write-back (0xFF)
        let mair: u64 = 0x00 | (0x44 << 8) | (0xBB << 16) | (0xFF << 24);
        core::arch::asm!("msr mair_el1, {}", in(reg) mair);

        // Configure TCR_EL1 (Translation Control Register)
        // T0SZ = 16 (48-bit VA for TTBR0)
        // T1SZ = 16 (48-bit VA for TTBR1)
        // TG0 = 0b00 (4KB granule for TTBR0)
        // TG1 = 0b10 (4KB granule for TTBR1)
        // IPS = 0b101 (48-bit PA, 256TB)
        // SH0/SH1 = 0b11 (Inner shareable)
        // ORGN0/ORGN1 = 0b01 (Write-back, write-allocate)
        // IRGN0/IRGN1 = 0b01 (Write-back, write-allocate)
        let tcr: u64 = (16 << 0)  // T0SZ
                     | (16 << 16) // T1SZ
                     | (0b00 << 14) // TG0 = 4KB
                     | (0b10 << 30) // TG1 = 4KB
                     | (0b101 << 32) // IPS = 48-bit
                     | (0b11 << 12) // SH0 = Inner shareable
                     | (0b11 << 28) // SH1 = Inner shareable
                     | (0b01 << 10) // ORGN0
                     | (0b01 << 8)  // IRGN0
                     | (0b01 << 26) // ORGN1
                     | (0b01 << 24); // IRGN1
        core::arch::asm!("msr tcr_el1, {}", in(reg) tcr);

        // Set TTBR0_EL1 to kernel L0 table for identity mapping
        // The kernel runs at 0x40000000 which is in TTBR0's range (lower half)
        core::arch::asm!("msr ttbr0_el1, {}", in(reg) l0_addr);

        // Set TTBR1_EL1 to the same for now (kernel can use either)
        core::arch::asm!("msr ttbr1_el1, {}", in(reg) l0_addr);

        // Ensure all writes are visible
        core::arch::asm!("isb");
        core::arch::asm!("dsb sy");

        // Invalidate TLB
        core::arch::asm!("tlbi vmalle1");
        core::arch::asm!("dsb sy");
        core::arch::asm!("isb");

        // Enable MMU in SCTLR_EL1
        let mut sctlr: u64;
        core::arch::asm!("mrs {}, sctlr_el1", out(reg) sctlr);

        // Set M bit (MMU enable) and clear some potentially problematic bits
        sctlr |= 1 << 0;  // M - MMU enable
        sctlr |= 1 << 2;  // C - Data cache enable
        sctlr |= 1 << 12; // I - Instruction cache enable
        sctlr &= !(1 << 19); // WXN - Write Execute Never (disable for now)

        core::arch::asm!("msr sctlr_el1, {}", in(reg) sctlr);
        core::arch::asm!("isb");
    }

    MMU_INITIALIZED.store(true, Ordering::Release);
}

/// Build kernel page tables with identity mapping
///
/// Maps:
/// - 0x0000_0000 - 0x3FFF_FFFF: Device memory (GIC, UART, VirtIO)
/// - 0x4000_0000 - RAM end: Normal memory (kernel code/data/heap)
unsafe fn build_kernel_page_tables(ram_base: usize, ram_size: usize) {
    // For TTBR1, addresses have upper bits set (0xFFFF_...)
    // The VA 0xFFFF_0000_4000_0000 would map to PA 0x4000_0000
    // But for simplicity, we'll use identity mapping in TTBR0 first
    // then transition to split addressing

    // For now, set up identity mapping using TTBR0-style addresses
    // (kernel can access via either low or high addresses initially)

    // L0 index 0 covers 0x0000_0000_0000_0000 - 0x0000_007F_FFFF_FFFF (512GB)
    // We need to map the first few GB where QEMU virt machine has devices and RAM

    // Get raw pointers to avoid static_mut_refs
    let l0_ptr = addr_of_mut!(KERNEL_L0);
    let l1_ptr = addr_of_mut!(KERNEL_L1);

    // L0[0] -> L1 table
    let l1_addr = l1_ptr as u64;
    unsafe {
        (*l0_ptr).entries[0] = l1_addr | flags::VALID | flags::TABLE;

        // L1 entries: each covers 1GB
        // L1[0]: 0x0000_0000 - 0x3FFF_FFFF (Device memory - GIC, UART, VirtIO)
        (*l1_ptr).entries[0] = 0x0000_0000u64
            | flags::VALID
            | flags::BLOCK
            | flags::AF
            | attr_index(MAIR_DEVICE_NGNRNE)
            | flags::PXN
            | flags::UXN
            | flags::SH_OUTER;

        // L1[1]: 0x4000_0000 - 0x7FFF_FFFF (RAM - normal memory)
        (*l1_ptr).entries[1] = 0x4000_0000u64
            | flags::VALID
            | flags::BLOCK
            | flags::AF
            | attr_index(MAIR_NORMAL_WB)
            | flags::SH_INNER;

        // Map additional RAM if needed (for larger memory configs)
        let ram_end = ram_base + ram_size;
        let mut addr = 0x8000_0000usize;
        let mut idx = 2usize;

        while addr < ram_end && idx < ENTRIES_PER_TABLE {
            (*l1_ptr).entries[idx] = (addr as u64)
                | flags::VALID
                | flags::BLOCK
                | flags::AF
                | attr_index(MAIR_NORMAL_WB)
                | flags::SH_INNER;
            addr += BLOCK_1GB;
            idx += 1;
        }
    }
}

/// Get the physical address of the kernel L0 page table
pub fn kernel_ttbr1() -> u64 {
    unsafe { addr_of_mut!(KERNEL_L0) as u64 }
}

/// Invalidate all TLB entries
pub fn flush_tlb_all() {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalle1",
            "dsb ish",
            "isb"
        );
    }
}

/// Invalidate TLB entries for a specific ASID
pub fn flush_tlb_asid(asid: u16) {
    unsafe {
        let asid_val = (asid as u64) << 48;
        core::arch::asm!(
            "dsb ishst",
            "tlbi aside1, {}",
            "dsb ish",
            "isb",
            in(reg) asid_val
        );
    }
}

/// Invalidate TLB entry for a specific virtual address
pub fn flush_tlb_page(va: usize) {
    unsafe {
        let va_shifted = (va >> 12) as u64;
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1, {}",
            "dsb ish",
            "isb",
            in(reg) va_shifted
        );
    }
}

// ============================================================================
// Physical/virtual address translation
// ============================================================================

/// The kernel identity-maps all of RAM through TTBR0 (see `build_kernel_page_tables`
/// and `UserAddressSpace::init` in `vmm::address_space`, which copies the same
/// low-half entries into every process's table), so physical and kernel virtual
/// addresses currently coincide. These two functions are the single seam that
/// would need to change if the kernel ever relocates to TTBR1 (§9 open question).
#[inline(always)]
pub fn phys_to_virt(phys: usize) -> *mut u8 {
    phys as *mut u8
}

#[inline(always)]
pub fn virt_to_phys(virt: usize) -> usize {
    virt
}

/// Full leaf-entry physical address mask (bits 47:12 for a 4KB-granule PTE).
pub const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Compose a TTBR0_EL1 value from a translation table base and an ASID.
#[inline]
pub const fn make_ttbr0(table_phys: usize, asid: u16) -> u64 {
    (table_phys as u64) | ((asid as u64) << 48)
}

/// Write TTBR0_EL1 and issue the barriers required before the hardware
/// walker is guaranteed to use the new root (spec §4.7/§5).
pub fn switch_address_space(table_phys: usize, asid: u16) {
    let ttbr0 = make_ttbr0(table_phys, asid);
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {ttbr0}",
            "isb",
            ttbr0 = in(reg) ttbr0,
        );
    }
}


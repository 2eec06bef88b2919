// `no_std`/`no_main` are lifted under `cargo test`: the host test binary
// links std so pure-logic `#[cfg(test)]` modules scattered through the
// kernel tree (mm::buddy, errors, ...) can run under the ordinary libtest
// harness instead of needing a QEMU-resident runner.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

mod allocator;
mod boot;
mod bytecode;
mod cap;
mod config;
mod console;
mod errors;
mod exceptions;
mod gic;
mod irq;
mod loader;
mod mm;
mod mmu;
mod process;
mod sched;
mod syscall;
mod timer;
mod vmm;

use core::panic::PanicInfo;

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}

static PROMPT: &str = "viper >: ";

unsafe extern "C" {
    /// Marks the end of the kernel image; provided by the linker script.
    /// Everything below this (up to `PMM_LOW_REGION_SIZE`) is bitmap-
    /// tracked free memory once the PMM takes over.
    static _kernel_end: u8;
}

/// Boot-time RAM window: QEMU's `virt` machine places RAM at 1GB with
/// `-m 512` by default; a real boot would read this from the DTB that
/// `rust_start` is handed instead of hard-coding it.
const RAM_BASE: usize = boot::KERNEL_PHYS_BASE;
const RAM_SIZE: usize = 512 * 1024 * 1024;

/// Sequences bring-up of every kernel subsystem in dependency order:
/// physical pages before anything that allocates, the heap before
/// anything using `alloc`, address space/capability/scheduler machinery
/// before any process can be spawned.
fn kernel_init() {
    let kernel_end = unsafe { core::ptr::addr_of!(_kernel_end) as usize };

    mmu::init(RAM_BASE, RAM_SIZE);
    mm::pmm::init(RAM_BASE, RAM_SIZE, kernel_end);
    allocator::mark_pmm_ready();
    mm::cow::COW_TABLE.init(RAM_BASE, RAM_SIZE);

    gic::init();
    exceptions::init();
    timer::init();

    sched::init();
    mm::pressure::init();
}

#[unsafe(no_mangle)]
pub extern "C" fn rust_start(_dtb: usize) -> ! {
    allocator::init(RAM_BASE + config::PMM_LOW_REGION_SIZE, 16 * 1024 * 1024)
        .expect("early heap init");

    kernel_init();

    console::print(PROMPT);

    let mut should_exit = false;
    while !should_exit {
        let mut line = [0u8; 100];
        let len = console::read_line(&mut line);
        if len == 0 {
            console::print(PROMPT);
            continue;
        }
        if let Ok(text) = core::str::from_utf8(&line[..len]) {
            match text {
                "exit" => {
                    console::print("\nBye!\n");
                    should_exit = true;
                }
                "meow" => {
                    console::print("\nMeow\n");
                }
                _ => {}
            }
        }
        if !should_exit {
            console::print(PROMPT);
        }
    }

    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}

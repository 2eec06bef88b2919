//! Memory management: physical pages, the buddy allocator, the kernel heap,
//! the slab allocator, copy-on-write bookkeeping, and swap.

pub mod buddy;
pub mod cow;
pub mod kheap;
pub mod pmm;
pub mod pressure;
pub mod slab;
pub mod swap;

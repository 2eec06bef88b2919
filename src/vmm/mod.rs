//! Virtual memory: per-process AArch64 address spaces and their VMA lists.

pub mod address_space;
pub mod vma;

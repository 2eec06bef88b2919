//! ELF loader and process spawn (spec §4.11): parses a static AArch64
//! executable and maps its `PT_LOAD` segments into a freshly created
//! address space, using the `elf` crate for parsing the same way the
//! teacher's original loader did.

use alloc::collections::BTreeMap;

use elf::abi::{EM_AARCH64, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD};
use elf::endian::LittleEndian;
use elf::ElfBytes;

use crate::config::{PAGE_SIZE, USER_CODE_BASE, USER_PROC_STACK_SIZE, USER_STACK_TOP};
use crate::mm::pmm;
use crate::mmu::flags as pte;
use crate::vmm::address_space::{AddressSpace, VmmError};

pub struct LoadedElf {
    pub entry_point: usize,
    pub address_space: AddressSpace,
    /// Highest mapped virtual address, used as the initial `brk`.
    pub brk: usize,
}

#[derive(Debug)]
pub enum ElfError {
    InvalidFormat(&'static str),
    WrongArchitecture,
    NotExecutable,
    OutOfMemory,
    AddressSpaceFailed,
    MappingFailed(VmmError),
}

impl core::fmt::Display for ElfError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ElfError::InvalidFormat(msg) => write!(f, "invalid ELF format: {msg}"),
            ElfError::WrongArchitecture => write!(f, "not an AArch64 binary"),
            ElfError::NotExecutable => write!(f, "not an executable or PIE"),
            ElfError::OutOfMemory => write!(f, "out of memory"),
            ElfError::AddressSpaceFailed => write!(f, "failed to create address space"),
            ElfError::MappingFailed(e) => write!(f, "mapping failed: {e:?}"),
        }
    }
}

impl From<VmmError> for ElfError {
    fn from(e: VmmError) -> Self {
        ElfError::MappingFailed(e)
    }
}

fn segment_leaf_flags(elf_flags: u32) -> u64 {
    let writable = elf_flags & PF_W != 0;
    let executable = elf_flags & PF_X != 0;

    let mut bits = pte::VALID | pte::AF | pte::SH_INNER | pte::USER;
    bits |= if writable { pte::AP_RW_ALL } else { pte::AP_RO_ALL };
    if !executable {
        bits |= pte::PXN | pte::UXN;
    }
    bits
}

/// Parses `elf_data` and maps its loadable segments into a new address
/// space. PIE binaries (`ET_DYN`) are based at `USER_CODE_BASE`; static
/// executables (`ET_EXEC`) keep their linked addresses.
pub fn load_elf(elf_data: &[u8]) -> Result<LoadedElf, ElfError> {
    let elf = ElfBytes::<LittleEndian>::minimal_parse(elf_data)
        .map_err(|_| ElfError::InvalidFormat("parse failed"))?;

    if elf.ehdr.e_machine != EM_AARCH64 {
        return Err(ElfError::WrongArchitecture);
    }
    let is_pie = elf.ehdr.e_type == ET_DYN;
    if elf.ehdr.e_type != ET_EXEC && !is_pie {
        return Err(ElfError::NotExecutable);
    }

    let base = if is_pie { USER_CODE_BASE } else { 0 };
    let entry_point = base + elf.ehdr.e_entry as usize;

    let mut address_space = AddressSpace::new().map_err(|_| ElfError::AddressSpaceFailed)?;

    let mut brk: usize = 0;
    let mut mapped_pages: BTreeMap<usize, usize> = BTreeMap::new();

    let segments = elf
        .segments()
        .ok_or(ElfError::InvalidFormat("no program headers"))?;

    for phdr in segments.iter() {
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let vaddr = base + phdr.p_vaddr as usize;
        let memsz = phdr.p_memsz as usize;
        let filesz = phdr.p_filesz as usize;
        let offset = phdr.p_offset as usize;
        let leaf_flags = segment_leaf_flags(phdr.p_flags);

        let start_page = vaddr & !(PAGE_SIZE - 1);
        let end_page = (vaddr + memsz).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let num_pages = (end_page - start_page) / PAGE_SIZE;

        for i in 0..num_pages {
            let page_va = start_page + i * PAGE_SIZE;

            let frame_addr = if let Some(&pa) = mapped_pages.get(&page_va) {
                pa
            } else {
                let frame = pmm::alloc_page_zeroed().ok_or(ElfError::OutOfMemory)?;
                let pa = frame.start_address();
                address_space.map(page_va, pa, leaf_flags)?;
                mapped_pages.insert(page_va, pa);
                pa
            };

            let page_start_in_segment = page_va.saturating_sub(vaddr);
            if page_start_in_segment < filesz {
                let copy_start = if page_va < vaddr { vaddr - page_va } else { 0 };
                let file_offset = offset + page_start_in_segment;
                let copy_len = core::cmp::min(
                    PAGE_SIZE - copy_start,
                    filesz.saturating_sub(page_start_in_segment),
                );

                if copy_len > 0 && file_offset + copy_len <= elf_data.len() {
                    unsafe {
                        let dst = crate::mmu::phys_to_virt(frame_addr + copy_start);
                        let src = elf_data.as_ptr().add(file_offset);
                        core::ptr::copy_nonoverlapping(src, dst, copy_len);
                    }
                }
            }
        }

        let segment_end = vaddr + memsz;
        if segment_end > brk {
            brk = segment_end;
        }
    }

    Ok(LoadedElf {
        entry_point,
        address_space,
        brk,
    })
}

/// Loads `elf_data` and maps a fixed-size, guard-page-bounded user stack
/// below `USER_STACK_TOP`. Returns `(entry_point, address_space, initial_sp, brk)`.
pub fn load_elf_with_stack(
    elf_data: &[u8],
    stack_size: usize,
) -> Result<(usize, AddressSpace, usize, usize), ElfError> {
    let mut loaded = load_elf(elf_data)?;

    let stack_bottom = (USER_STACK_TOP - stack_size) & !(PAGE_SIZE - 1);
    let stack_pages = stack_size.div_ceil(PAGE_SIZE);

    let stack_flags = pte::VALID | pte::AF | pte::SH_INNER | pte::USER | pte::AP_RW_ALL | pte::PXN | pte::UXN;

    for i in 0..stack_pages {
        let page_va = stack_bottom + i * PAGE_SIZE;
        loaded.address_space.alloc_map(page_va, stack_flags)?;
    }

    let initial_sp = USER_STACK_TOP & !0xF;
    Ok((loaded.entry_point, loaded.address_space, initial_sp, loaded.brk))
}

pub const DEFAULT_USER_STACK_SIZE: usize = USER_PROC_STACK_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_aarch64_magic() {
        let bytes = [0u8; 64];
        assert!(matches!(load_elf(&bytes), Err(ElfError::InvalidFormat(_))));
    }
}

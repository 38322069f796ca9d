//! User program image loading.
//!
//! Executables are 32-bit ELF files; their loadable segments are mapped
//! into the current (the new process's own) address space. Called only from
//! the process bootstrap, inside the target context.

use elf::abi::{EM_386, ET_EXEC, PT_LOAD};
use elf::endian::LittleEndian;
use elf::file::Class;
use elf::ElfBytes;

use crate::hal;
use crate::io::fs;
use crate::mm::physical::{self, PhysPool};
use crate::mm::{PageFlags, VirtAddr, PAGE_SIZE};
use crate::rtl::{align_down, align_up};
use crate::status::{Result, Status};

/// Load `path` into the current address space; returns the entry point.
pub fn load_exec_image(path: &str) -> Result<VirtAddr> {
    let image = fs::read_file(path)?;
    let file = ElfBytes::<LittleEndian>::minimal_parse(&image).map_err(|_| Status::ElfBadFormat)?;
    if file.ehdr.class != Class::ELF32 {
        return Err(Status::ElfBadFormat);
    }
    if file.ehdr.e_machine != EM_386 {
        return Err(Status::NotCompatible);
    }
    if file.ehdr.e_type != ET_EXEC {
        return Err(Status::ElfBadFormat);
    }

    let segments = file.segments().ok_or(Status::ElfBadFormat)?;
    for segment in segments.iter() {
        if segment.p_type != PT_LOAD || segment.p_memsz == 0 {
            continue;
        }
        let start = align_down(segment.p_vaddr as usize, PAGE_SIZE);
        let end = align_up(segment.p_vaddr as usize + segment.p_memsz as usize, PAGE_SIZE);
        if !hal::validate_user_buffer(start, end - start) {
            return Err(Status::BadParameter);
        }

        let mut page = start;
        while page < end {
            let (pa, _) = physical::allocate(PAGE_SIZE, PAGE_SIZE, PhysPool::Standard)?;
            hal::map_page(page, pa, PageFlags::WRITABLE | PageFlags::USER)?;
            page += PAGE_SIZE;
        }

        let data = file
            .segment_data(&segment)
            .map_err(|_| Status::ElfBadFormat)?;
        unsafe {
            hal::fill_zero_at(start, end - start);
            hal::write_bytes_at(segment.p_vaddr as usize, data);
        }
    }

    Ok(file.ehdr.e_entry as VirtAddr)
}

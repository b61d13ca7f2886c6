//! Reading and placing the kernel's ELF image.
//!
//! Only statically linked x86-64 executables are supported. Segments are loaded at their physical
//! addresses with no relocation.

use alloc::vec;
use alloc::vec::Vec;

use goblin::elf64::header::{
    Header, EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, ET_EXEC, SELFMAG,
    SIZEOF_EHDR,
};
use goblin::elf64::program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_LOAD, SIZEOF_PHDR};
use goblin::elf64::section_header::{SectionHeader, SIZEOF_SHDR};
use log::{debug, info};
use plain::Plain;
use x86_64::align_up;

use crate::error::{BootError, ImageError};
use crate::file::File;
use crate::firmware::{FileHandle, Firmware, MemoryClass};
use crate::ledger::{Arena, Owner};
use crate::util::{page_base, pages_for, PAGE_SIZE};

/// Longest section name the locator will compare, including the NUL
pub const SECTION_NAME_MAX: usize = 256;

/// Where a loadable segment ended up
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlacedSegment {
    pub base: u64,
    pub file_size: u64,
    pub memory_size: u64,
    pub executable: bool,
}

/// A kernel image whose ELF header has been validated
pub struct KernelImage<H: FileHandle> {
    file: File<H>,
    header: Header,
}

impl<H: FileHandle> KernelImage<H> {
    /// Reads and validates the ELF header. Nothing is placed in memory.
    pub fn open(mut file: File<H>) -> Result<KernelImage<H>, BootError> {
        let mut bytes = [0u8; SIZEOF_EHDR];
        if file.read_at(0, &mut bytes)? < SIZEOF_EHDR {
            return Err(ImageError::Truncated.into());
        }

        let mut header = Header::default();
        // The buffer is exactly the header's size
        let _ = header.copy_from_bytes(&bytes);
        validate_header(&header)?;

        debug!(
            "{} is a valid kernel image with entry point {:#x} and {} program headers",
            file.path(),
            header.e_entry,
            header.e_phnum
        );
        Ok(KernelImage { file, header })
    }

    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    /// Reads the program headers, honoring the image's declared entry size
    pub fn program_headers(&mut self) -> Result<Vec<ProgramHeader>, BootError> {
        let stride = self.header.e_phentsize as u64;
        let base = self.header.e_phoff;
        (0..self.header.e_phnum as u64)
            .map(|index| self.file.read_as::<ProgramHeader, SIZEOF_PHDR>(base + index * stride))
            .collect()
    }

    /// Copies every loadable segment to its physical address and zeroes the rest of its memory
    pub fn load_segments<F: Firmware<File = H>>(
        &mut self,
        firmware: &mut F,
        arena: &mut Arena,
    ) -> Result<Vec<PlacedSegment>, BootError> {
        let mut placed = Vec::new();
        for segment in self.program_headers()? {
            if segment.p_type != PT_LOAD {
                continue;
            }
            if let Some(segment) = self.load_segment(firmware, arena, &segment)? {
                placed.push(segment);
            }
        }
        Ok(placed)
    }

    fn load_segment<F: Firmware<File = H>>(
        &mut self,
        firmware: &mut F,
        arena: &mut Arena,
        segment: &ProgramHeader,
    ) -> Result<Option<PlacedSegment>, BootError> {
        if segment.p_memsz < segment.p_filesz {
            return Err(ImageError::SegmentSizeMismatch {
                address: segment.p_paddr,
                memory_size: segment.p_memsz,
                file_size: segment.p_filesz,
            }
            .into());
        }
        if segment.p_memsz == 0 {
            debug!("Skipping empty segment at {:#x}", segment.p_paddr);
            return Ok(None);
        }

        let perm = |flag: u32, symbol: char| {
            if segment.p_flags & flag != 0 {
                symbol
            } else {
                '-'
            }
        };
        info!(
            "Loading segment {:#x} - {:#x} ({} bytes) [{}{}{}]",
            segment.p_paddr,
            segment.p_paddr + segment.p_memsz,
            segment.p_memsz,
            perm(PF_R, 'r'),
            perm(PF_W, 'w'),
            perm(PF_X, 'x')
        );

        let executable = segment.p_flags & PF_X != 0;
        let class = if executable {
            MemoryClass::ImageCode
        } else {
            MemoryClass::ImageData
        };
        let end = segment.p_paddr + segment.p_memsz;
        claim_pages(firmware, arena, class, segment.p_paddr, end)?;

        // Safety: every page of the segment now belongs to the kernel
        let memory =
            unsafe { firmware.physical_memory(segment.p_paddr, segment.p_memsz as usize) };
        let (contents, bss) = memory.split_at_mut(segment.p_filesz as usize);
        self.file.read_exact_at(segment.p_offset, contents)?;
        bss.fill(0);

        Ok(Some(PlacedSegment {
            base: segment.p_paddr,
            file_size: segment.p_filesz,
            memory_size: segment.p_memsz,
            executable,
        }))
    }

    /// Finds the section called `name`
    pub fn find_section(&mut self, name: &'static str) -> Result<SectionHeader, BootError> {
        check_section_table(&self.header)?;
        let names = self.section_header(self.header.e_shstrndx)?;

        let mut buffer = [0u8; SECTION_NAME_MAX];
        for index in 0..self.header.e_shnum {
            let section = self.section_header(index)?;
            if self.section_name(&names, section.sh_name, &mut buffer)? == name.as_bytes() {
                debug!("Found section {} at offset {:#x}", name, section.sh_offset);
                return Ok(section);
            }
        }

        Err(ImageError::SectionNotFound(name).into())
    }

    /// Reads the first `len` bytes of `section`
    pub fn read_section(
        &mut self,
        section: &SectionHeader,
        len: usize,
    ) -> Result<Vec<u8>, BootError> {
        let mut contents = vec![0u8; len];
        self.file.read_exact_at(section.sh_offset, &mut contents)?;
        Ok(contents)
    }

    fn section_header(&mut self, index: u16) -> Result<SectionHeader, BootError> {
        let offset = self.header.e_shoff + index as u64 * self.header.e_shentsize as u64;
        self.file.read_as::<SectionHeader, SIZEOF_SHDR>(offset)
    }

    fn section_name<'b>(
        &mut self,
        names: &SectionHeader,
        offset: u32,
        buffer: &'b mut [u8; SECTION_NAME_MAX],
    ) -> Result<&'b [u8], BootError> {
        if offset as u64 >= names.sh_size {
            return Err(ImageError::InvalidSectionName(offset).into());
        }

        let available = (names.sh_size - offset as u64).min(SECTION_NAME_MAX as u64) as usize;
        let read = self
            .file
            .read_at(names.sh_offset + offset as u64, &mut buffer[..available])?;
        match buffer[..read].iter().position(|&byte| byte == 0) {
            Some(end) => Ok(&buffer[..end]),
            None => Err(ImageError::SectionNameTooLong(offset).into()),
        }
    }
}

/// Checks that `header` describes a little-endian x86-64 ELF64 executable with program headers
pub fn validate_header(header: &Header) -> Result<(), ImageError> {
    if &header.e_ident[..SELFMAG] != ELFMAG {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header.e_ident[..4]);
        return Err(ImageError::BadMagic(magic));
    }
    if header.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(ImageError::WrongClass(header.e_ident[EI_CLASS]));
    }
    if header.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(ImageError::WrongByteOrder(header.e_ident[EI_DATA]));
    }
    if header.e_type != ET_EXEC {
        return Err(ImageError::WrongType(header.e_type));
    }
    if header.e_machine != EM_X86_64 {
        return Err(ImageError::WrongMachine(header.e_machine));
    }
    if header.e_phoff == 0 || header.e_phnum == 0 {
        return Err(ImageError::MissingProgramHeaders);
    }
    if (header.e_phentsize as usize) < SIZEOF_PHDR {
        return Err(ImageError::BadProgramHeaderSize(header.e_phentsize));
    }
    Ok(())
}

fn check_section_table(header: &Header) -> Result<(), ImageError> {
    if header.e_shoff == 0 || header.e_shnum == 0 {
        return Err(ImageError::MissingSectionTable);
    }
    if (header.e_shentsize as usize) < SIZEOF_SHDR {
        return Err(ImageError::BadSectionHeaderSize(header.e_shentsize));
    }
    // Index 0 is the null section, which never holds names
    if header.e_shstrndx == 0 || header.e_shstrndx >= header.e_shnum {
        return Err(ImageError::MissingStringTable(header.e_shstrndx));
    }
    Ok(())
}

/// Allocates the pages under `[start, end)` for the kernel, skipping pages an earlier segment
/// already claimed
fn claim_pages<F: Firmware>(
    firmware: &mut F,
    arena: &mut Arena,
    class: MemoryClass,
    start: u64,
    end: u64,
) -> Result<(), BootError> {
    let start = page_base(start);
    let end = align_up(end, PAGE_SIZE);

    let claimed: Vec<(u64, u64)> = arena
        .overlapping(start, end)
        .filter(|allocation| allocation.owner == Owner::Kernel)
        .map(|allocation| (allocation.base, allocation.end()))
        .collect();

    let mut cursor = start;
    for (base, claimed_end) in claimed {
        if base > cursor {
            let pages = pages_for(base - cursor);
            arena.allocate_at(firmware, Owner::Kernel, class, cursor, pages)?;
        }
        cursor = cursor.max(claimed_end);
    }
    if cursor < end {
        let pages = pages_for(end - cursor);
        arena.allocate_at(firmware, Owner::Kernel, class, cursor, pages)?;
    }
    Ok(())
}

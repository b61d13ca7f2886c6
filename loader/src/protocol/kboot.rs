use core::mem::{self, offset_of};

use log::info;
use plain::Plain;
use tomatboot_boot_info::kboot::{
    KbootFramebuffer, KbootHeader, KbootInfo, KbootMmap, MappingType, CMDLINE_CAPACITY,
    HEADER_SECTION, MAGIC,
};

use super::{BootFacts, MapBuffer, Protocol};
use crate::error::{BootError, ImageError};
use crate::firmware::Firmware;
use crate::ledger::{Arena, Owner};
use crate::memory_map::{MapOverflow, RawMemoryMap};
use crate::util::{pages_for, write_physical};

/// Kernels that embed a `.kboot.header` section. They get their command line inline and the
/// firmware memory map untranslated.
pub enum Kboot {}

impl Protocol for Kboot {
    const NAME: &'static str = "kboot";
    const MAGIC: u64 = MAGIC;
    const HEADER_SECTION: Option<&'static str> = Some(HEADER_SECTION);
    const HEADER_SIZE: usize = mem::size_of::<KbootHeader>();
    const SUPPORTS_MODULES: bool = false;
    const WANTS_TSC_FREQUENCY: bool = false;

    /// Physical address of the info block's memory map fields
    type MapTarget = u64;

    fn check_header(bytes: &[u8]) -> Result<(), ImageError> {
        let mut header = KbootHeader::default();
        header.copy_from_bytes(bytes).map_err(|_| ImageError::SectionTooSmall {
            name: HEADER_SECTION,
            size: bytes.len() as u64,
            expected: mem::size_of::<KbootHeader>(),
        })?;

        match header.mapping.ty {
            MappingType::IDENTITY => {
                info!("Kernel requests identity-mapped physical memory");
                Ok(())
            }
            MappingType(other) => Err(ImageError::UnsupportedMapping(other)),
        }
    }

    fn write_info<F: Firmware>(
        firmware: &mut F,
        arena: &mut Arena,
        facts: &BootFacts,
    ) -> Result<u64, BootError> {
        if !facts.modules.is_empty() {
            return Err(BootError::ModulesUnsupported {
                protocol: Self::NAME,
            });
        }
        let command_line = facts.command_line.as_bytes();
        if command_line.len() >= CMDLINE_CAPACITY {
            return Err(BootError::CommandLineTooLong {
                length: command_line.len(),
                max: CMDLINE_CAPACITY - 1,
            });
        }

        let mut info = KbootInfo::empty();
        info.cmdline.length = command_line.len() as u64;
        info.cmdline.cmdline[..command_line.len()].copy_from_slice(command_line);

        if let Some(mode) = facts.framebuffer {
            info.framebuffer = KbootFramebuffer {
                width: mode.width,
                height: mode.height,
                address: mode.base,
            };
        }

        let pages = pages_for(mem::size_of::<KbootInfo>() as u64);
        let address = arena.allocate_zeroed(firmware, Owner::BootInfo, pages)?;
        unsafe { write_physical(firmware, address, info) };
        Ok(address)
    }

    fn prepare_memory_map<F: Firmware>(
        _firmware: &mut F,
        _arena: &mut Arena,
        info: u64,
        _buffer: &MapBuffer,
    ) -> Result<u64, BootError> {
        Ok(info + offset_of!(KbootInfo, mmap) as u64)
    }

    fn finish_memory_map<F: Firmware>(
        firmware: &mut F,
        target: u64,
        map: &RawMemoryMap,
        _arena: &Arena,
    ) -> Result<(), MapOverflow> {
        let mmap = KbootMmap {
            descriptors: map.address,
            descriptor_size: map.descriptor_size as u64,
            count: map.len() as u64,
        };
        unsafe { write_physical(firmware, target, mmap) };
        Ok(())
    }
}

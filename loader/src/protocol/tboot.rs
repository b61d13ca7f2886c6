use core::mem::{self, offset_of};

use log::debug;
use tomatboot_boot_info::tboot::{
    TbootCmdline, TbootFlags, TbootFramebuffer, TbootInfo, TbootMmap, TbootModule, TbootModules,
    MAGIC,
};
use tomatboot_boot_info::MemoryMapEntry;

use super::{BootFacts, MapBuffer, Protocol};
use crate::error::BootError;
use crate::firmware::Firmware;
use crate::ledger::{Arena, Owner};
use crate::memory_map::{translate, translated_capacity, MapOverflow, RawMemoryMap};
use crate::modules::LoadedModule;
use crate::util::{pages_for, physical_slice, write_physical, PAGE_SIZE};

/// Kernels that get a flagged info block with modules and a translated memory map
pub enum Tboot {}

#[derive(Debug, Copy, Clone)]
pub struct TbootMapTarget {
    info: u64,
    entries: u64,
    capacity: usize,
}

impl Protocol for Tboot {
    const NAME: &'static str = "tboot";
    const MAGIC: u64 = MAGIC;
    const HEADER_SECTION: Option<&'static str> = None;
    const SUPPORTS_MODULES: bool = true;
    const WANTS_TSC_FREQUENCY: bool = true;

    type MapTarget = TbootMapTarget;

    fn write_info<F: Firmware>(
        firmware: &mut F,
        arena: &mut Arena,
        facts: &BootFacts,
    ) -> Result<u64, BootError> {
        let pages = pages_for(mem::size_of::<TbootInfo>() as u64);
        let address = arena.allocate_zeroed(firmware, Owner::BootInfo, pages)?;
        let mut info = TbootInfo::default();

        let tag_bytes: usize = facts.modules.iter().map(|m| m.tag.len() + 1).sum();
        let string_bytes = facts.command_line.len() + 1 + tag_bytes;
        let mut strings = StringTable::allocate(firmware, arena, string_bytes)?;

        info.cmdline = TbootCmdline {
            length: facts.command_line.len() as u64,
            cmdline: strings.push(firmware, facts.command_line),
        };
        info.flags |= TbootFlags::CMDLINE;

        info.modules = write_modules(firmware, arena, &mut strings, facts.modules)?;
        info.flags |= TbootFlags::MODULES;

        if let Some(frequency) = facts.tsc_frequency {
            info.tsc_freq = frequency;
            info.flags |= TbootFlags::TSC_FREQ;
        }

        if let Some(rsdp) = facts.rsdp {
            info.rsdp = rsdp.address;
            info.flags |= TbootFlags::RSDP;
        }

        if let Some(mode) = facts.framebuffer {
            info.framebuffer = TbootFramebuffer {
                address: mode.base,
                width: mode.width,
                height: mode.height,
                pitch: mode.stride,
                format: mode.format,
            };
            info.flags |= TbootFlags::FRAMEBUFFER;
        }

        unsafe { write_physical(firmware, address, info) };
        Ok(address)
    }

    fn prepare_memory_map<F: Firmware>(
        firmware: &mut F,
        arena: &mut Arena,
        info: u64,
        buffer: &MapBuffer,
    ) -> Result<TbootMapTarget, BootError> {
        // The entries array is one more allocation that can split a descriptor
        let needed = translated_capacity(buffer.descriptor_capacity(), arena) + 2;
        let pages = pages_for((needed * mem::size_of::<MemoryMapEntry>()) as u64);
        let entries = arena.allocate(firmware, Owner::BootInfo, pages)?;

        let capacity = pages * PAGE_SIZE as usize / mem::size_of::<MemoryMapEntry>();
        debug!(
            "Reserved room for {} memory map entries at {:#x}",
            capacity, entries
        );
        Ok(TbootMapTarget {
            info,
            entries,
            capacity,
        })
    }

    fn finish_memory_map<F: Firmware>(
        firmware: &mut F,
        target: TbootMapTarget,
        map: &RawMemoryMap,
        arena: &Arena,
    ) -> Result<(), MapOverflow> {
        let entries = unsafe {
            physical_slice::<F, MemoryMapEntry>(firmware, target.entries, target.capacity)
        };
        let count = translate(map.descriptors(), arena, entries)?;
        debug!(
            "Translated {} firmware descriptors into {} entries",
            map.len(),
            count
        );

        unsafe {
            let mmap = TbootMmap {
                count: count as u64,
                entries: target.entries,
            };
            write_physical(firmware, target.info + offset_of!(TbootInfo, mmap) as u64, mmap);

            let flags_address = target.info + offset_of!(TbootInfo, flags) as u64;
            let flags = physical_slice::<F, TbootFlags>(firmware, flags_address, 1)[0];
            write_physical(firmware, flags_address, flags | TbootFlags::MMAP);
        }
        Ok(())
    }
}

fn write_modules<F: Firmware>(
    firmware: &mut F,
    arena: &mut Arena,
    strings: &mut StringTable,
    modules: &[LoadedModule],
) -> Result<TbootModules, BootError> {
    if modules.is_empty() {
        return Ok(TbootModules::default());
    }

    let pages = pages_for((modules.len() * mem::size_of::<TbootModule>()) as u64);
    let address = arena.allocate(firmware, Owner::BootInfo, pages)?;
    for (index, module) in modules.iter().enumerate() {
        let entry = TbootModule {
            base: module.base,
            length: module.length,
            name: strings.push(firmware, &module.tag),
        };
        let slot = address + (index * mem::size_of::<TbootModule>()) as u64;
        unsafe { write_physical(firmware, slot, entry) };
    }

    Ok(TbootModules {
        count: modules.len() as u64,
        entries: address,
    })
}

/// Packs NUL-terminated strings into one boot info allocation
struct StringTable {
    next: u64,
    end: u64,
}

impl StringTable {
    fn allocate<F: Firmware>(
        firmware: &mut F,
        arena: &mut Arena,
        bytes: usize,
    ) -> Result<StringTable, BootError> {
        let base = arena.allocate(firmware, Owner::BootInfo, pages_for(bytes as u64))?;
        Ok(StringTable {
            next: base,
            end: base + bytes as u64,
        })
    }

    /// Copies `text` in and returns its address
    fn push<F: Firmware>(&mut self, firmware: &mut F, text: &str) -> u64 {
        let address = self.next;
        let len = text.len() + 1;
        debug_assert!(address + len as u64 <= self.end, "string table overflow");

        let memory = unsafe { firmware.physical_memory(address, len) };
        memory[..text.len()].copy_from_slice(text.as_bytes());
        memory[text.len()] = 0;
        self.next += len as u64;
        address
    }
}

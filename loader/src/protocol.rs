//! The two kernel protocols.
//!
//! Both share the same pipeline. They differ in how the kernel identifies itself, whether it can
//! receive modules, how the info block is laid out, and whether the memory map is translated.

use crate::acpi::Rsdp;
use crate::error::{BootError, ImageError};
use crate::firmware::{DisplayMode, Firmware};
use crate::ledger::Arena;
use crate::memory_map::{MapOverflow, RawMemoryMap};
use crate::modules::LoadedModule;

mod kboot;
mod tboot;

pub use kboot::Kboot;
pub use tboot::Tboot;

/// Everything gathered about the machine before the info block is written
#[derive(Debug)]
pub struct BootFacts<'a> {
    pub command_line: &'a str,
    pub modules: &'a [LoadedModule],
    pub rsdp: Option<Rsdp>,
    pub framebuffer: Option<DisplayMode>,
    pub tsc_frequency: Option<u64>,
}

/// Buffer reserved for the final firmware memory map
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapBuffer {
    pub address: u64,
    /// Size of the buffer in bytes
    pub capacity: usize,
    pub descriptor_size: usize,
}

impl MapBuffer {
    /// Number of firmware descriptors the buffer can hold
    pub fn descriptor_capacity(&self) -> usize {
        self.capacity / self.descriptor_size
    }
}

pub trait Protocol {
    const NAME: &'static str;

    /// Passed to the kernel in its first argument register
    const MAGIC: u64;

    /// Section the kernel must carry, if any
    const HEADER_SECTION: Option<&'static str>;

    /// Size of the header expected in [`Protocol::HEADER_SECTION`]
    const HEADER_SIZE: usize = 0;

    const SUPPORTS_MODULES: bool;

    /// Whether the kernel is told the timestamp counter frequency
    const WANTS_TSC_FREQUENCY: bool;

    /// Whatever [`Protocol::finish_memory_map`] needs to find its way back into the info block
    type MapTarget: Copy;

    /// Checks the contents of the kernel's header section
    fn check_header(_header: &[u8]) -> Result<(), ImageError> {
        Ok(())
    }

    /// Writes the info block and everything it points to, returning its physical address
    fn write_info<F: Firmware>(
        firmware: &mut F,
        arena: &mut Arena,
        facts: &BootFacts,
    ) -> Result<u64, BootError>;

    /// Reserves whatever else the final memory map needs. This is the last chance to allocate
    /// memory.
    fn prepare_memory_map<F: Firmware>(
        firmware: &mut F,
        arena: &mut Arena,
        info: u64,
        buffer: &MapBuffer,
    ) -> Result<Self::MapTarget, BootError>;

    /// Records the final memory map in the info block. Runs after boot services are gone, so it may
    /// only touch memory.
    fn finish_memory_map<F: Firmware>(
        firmware: &mut F,
        target: Self::MapTarget,
        map: &RawMemoryMap,
        arena: &Arena,
    ) -> Result<(), MapOverflow>;
}

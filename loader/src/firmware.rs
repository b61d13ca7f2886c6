//! Boundary between the boot pipeline and the platform firmware.
//!
//! The UEFI binary implements [`Firmware`] on top of boot services. Tests use a simulated
//! implementation with an in-memory physical address space.

use alloc::vec::Vec;

use tomatboot_boot_info::PixelFormat;
use uefi::boot::MemoryType;
use uefi::{Guid, Status};

/// Firmware memory type for executable kernel segments
pub const IMAGE_CODE: MemoryType = MemoryType(0x8000_0000);
/// Firmware memory type for the remaining kernel segments
pub const IMAGE_DATA: MemoryType = MemoryType(0x8000_0001);
/// Firmware memory type for the boot info block and everything it points to
pub const BOOT_INFO: MemoryType = MemoryType(0x8000_0002);
/// Firmware memory type for boot module contents
pub const MODULE: MemoryType = MemoryType(0x8000_0003);

/// The memory classes the loader allocates under. They use firmware memory types from the range
/// reserved for OS loaders, `0x8000_0000..=0xFFFF_FFFF`, so they stay distinguishable from firmware
/// and loader memory in the firmware's own map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryClass {
    ImageCode,
    ImageData,
    BootInfo,
    Module,
}

impl MemoryClass {
    pub const fn memory_type(self) -> MemoryType {
        match self {
            MemoryClass::ImageCode => IMAGE_CODE,
            MemoryClass::ImageData => IMAGE_DATA,
            MemoryClass::BootInfo => BOOT_INFO,
            MemoryClass::Module => MODULE,
        }
    }

    pub fn from_memory_type(ty: MemoryType) -> Option<MemoryClass> {
        match ty {
            IMAGE_CODE => Some(MemoryClass::ImageCode),
            IMAGE_DATA => Some(MemoryClass::ImageData),
            BOOT_INFO => Some(MemoryClass::BootInfo),
            MODULE => Some(MemoryClass::Module),
            _ => None,
        }
    }
}

/// Where a page allocation has to go
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Exactly at this page-aligned physical address
    Fixed(u64),
    Anywhere,
}

/// Identifies one version of the firmware memory map
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapKey(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapSize {
    /// Bytes needed for the memory map right now
    pub map_size: usize,
    /// Distance between descriptors, at least the size of a descriptor
    pub descriptor_size: usize,
}

/// Result of a successful memory map fetch
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapSnapshot {
    /// Bytes of the buffer filled with descriptors
    pub len: usize,
    pub descriptor_size: usize,
    pub key: MapKey,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The buffer cannot hold the map, which currently needs `required` bytes
    BufferTooSmall { required: usize },
    Firmware(Status),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitError {
    /// The memory map changed since the key was issued
    StaleKey,
    Firmware(Status),
}

/// Entry in the firmware's configuration table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfigTable {
    pub guid: Guid,
    pub address: u64,
}

/// The active graphics mode
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    /// Pixels per scan line
    pub stride: u32,
    pub format: PixelFormat,
}

/// An open file on the boot volume
pub trait FileHandle {
    fn size(&mut self) -> Result<u64, Status>;

    fn set_position(&mut self, offset: u64) -> Result<(), Status>;

    /// Reads from the current position, returning how many bytes were read. Zero means end of
    /// file.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Status>;
}

/// Firmware services used by the loader.
///
/// Only [`Firmware::memory_map`], [`Firmware::physical_memory`] and the methods that never
/// return to the firmware may be used once [`Firmware::exit_boot_services`] has succeeded.
pub trait Firmware {
    type File: FileHandle;

    /// Opens a file on the volume the loader was started from. Paths use `/` separators.
    fn open(&mut self, path: &str) -> Result<Self::File, Status>;

    fn allocate_pages(
        &mut self,
        placement: Placement,
        class: MemoryClass,
        pages: usize,
    ) -> Result<u64, Status>;

    fn free_pages(&mut self, base: u64, pages: usize) -> Result<(), Status>;

    /// Views `len` bytes of physical memory starting at `base`.
    ///
    /// # Safety
    /// The range must be memory the loader owns or a firmware table it is allowed to read, and the
    /// caller must not keep overlapping slices alive at the same time.
    unsafe fn physical_memory(&mut self, base: u64, len: usize) -> &'static mut [u8];

    fn memory_map_size(&mut self) -> MapSize;

    /// Writes the current memory map into `buffer`
    fn memory_map(&mut self, buffer: &mut [u8]) -> Result<MapSnapshot, MapError>;

    /// Leaves boot services.
    ///
    /// # Safety
    /// After this succeeds, nothing may call back into boot services, including the allocator and
    /// the console.
    unsafe fn exit_boot_services(&mut self, key: MapKey) -> Result<(), ExitError>;

    /// Called once boot services are gone, so output can switch away from the firmware console
    fn boot_services_exited(&mut self);

    /// Masks interrupts and loads an empty interrupt descriptor table
    fn disable_interrupts(&mut self);

    fn config_tables(&mut self) -> Vec<ConfigTable>;

    fn display_mode(&mut self) -> Option<DisplayMode>;

    /// Busy-waits for at least `micros` microseconds
    fn stall(&mut self, micros: usize);

    /// Reads the CPU timestamp counter
    fn timestamp(&mut self) -> u64;

    fn halt(&mut self) -> !;

    /// Jumps to the kernel entry point with `magic` and `info` as its two arguments.
    ///
    /// # Safety
    /// Boot services must have been exited and interrupts disabled. The kernel and everything
    /// `info` points to must be in place.
    unsafe fn jump(&mut self, entry: u64, magic: u64, info: u64) -> !;
}

#![cfg_attr(not(test), no_std)]
//! Boot information handed from TomatBoot to the kernel.
//!
//! Two protocols are supported. [`kboot`] kernels embed a header in a `.kboot.header` section and
//! receive their command line inline and the raw firmware memory map. [`tboot`] kernels receive a
//! flagged info block with boot modules, the TSC frequency and a translated, coalesced memory map.
//!
//! All layouts are `repr(C)` and every address is physical. The kernel is entered with physical
//! memory identity-mapped, so the pointer accessors here can be used directly during early boot.

use core::fmt;

pub mod kboot;
pub mod memory_map;
pub mod tboot;

pub use memory_map::{MemoryMapEntry, MemoryType};

/// Layout of a framebuffer pixel
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    /// Red, green, blue and one reserved byte, in that order
    pub const RGB_RESERVED_8: PixelFormat = PixelFormat(0);
    /// Blue, green, red and one reserved byte, in that order
    pub const BGR_RESERVED_8: PixelFormat = PixelFormat(1);
    /// Channel positions are described by firmware-specific bit masks
    pub const BITMASK: PixelFormat = PixelFormat(2);
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PixelFormat::RGB_RESERVED_8 => f.write_str("RgbReserved8"),
            PixelFormat::BGR_RESERVED_8 => f.write_str("BgrReserved8"),
            PixelFormat::BITMASK => f.write_str("Bitmask"),
            PixelFormat(other) => write!(f, "PixelFormat({})", other),
        }
    }
}

unsafe impl plain::Plain for PixelFormat {}

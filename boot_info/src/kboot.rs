//! The kboot protocol.
//!
//! A kboot kernel declares a [`KbootHeader`] in a section named [`HEADER_SECTION`]. It is entered
//! with [`MAGIC`] in the first argument register and the physical address of a [`KbootInfo`] in
//! the second.

use core::slice;

use plain::Plain;

/// Value passed in the first argument register when entering a kboot kernel
pub const MAGIC: u64 = 0xCAFE_BABE;

/// Name of the section holding the kernel's [`KbootHeader`]
pub const HEADER_SECTION: &str = ".kboot.header";

/// Size of the inline command line buffer, including the terminating NUL
pub const CMDLINE_CAPACITY: usize = 256;

/// Header embedded in the kernel image
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct KbootHeader {
    pub mapping: KbootMapping,
}

unsafe impl Plain for KbootHeader {}

/// How the kernel expects physical memory to be mapped on entry
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct KbootMapping {
    pub ty: MappingType,
    _reserved: u32,
    /// Base of the direct physical mapping when `ty` is [`MappingType::VIRTUAL`]
    pub direct_mapping_base: u64,
}

impl KbootMapping {
    pub const fn new(ty: MappingType, direct_mapping_base: u64) -> KbootMapping {
        KbootMapping {
            ty,
            _reserved: 0,
            direct_mapping_base,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct MappingType(pub u32);

impl MappingType {
    /// Physical memory identity-mapped
    pub const IDENTITY: MappingType = MappingType(0);
    /// Physical memory mapped at a fixed virtual offset
    pub const VIRTUAL: MappingType = MappingType(1);
}

/// Information block handed to a kboot kernel
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct KbootInfo {
    pub cmdline: KbootCmdline,
    pub framebuffer: KbootFramebuffer,
    pub mmap: KbootMmap,
}

impl KbootInfo {
    pub const fn empty() -> KbootInfo {
        KbootInfo {
            cmdline: KbootCmdline {
                length: 0,
                cmdline: [0; CMDLINE_CAPACITY],
            },
            framebuffer: KbootFramebuffer {
                width: 0,
                height: 0,
                address: 0,
            },
            mmap: KbootMmap {
                descriptors: 0,
                descriptor_size: 0,
                count: 0,
            },
        }
    }

    pub fn command_line(&self) -> &[u8] {
        let length = (self.cmdline.length as usize).min(CMDLINE_CAPACITY - 1);
        &self.cmdline.cmdline[..length]
    }

    /// Raw firmware memory descriptors, `mmap.descriptor_size` bytes apart.
    ///
    /// # Safety
    /// The caller must ensure the descriptor buffer is still mapped at its physical address and has
    /// not been reused.
    pub unsafe fn descriptor_bytes(&self) -> &'static [u8] {
        if self.mmap.descriptors == 0 {
            return &[];
        }
        let length = (self.mmap.count * self.mmap.descriptor_size) as usize;
        slice::from_raw_parts(self.mmap.descriptors as usize as *const u8, length)
    }
}

impl Default for KbootInfo {
    fn default() -> KbootInfo {
        KbootInfo::empty()
    }
}

unsafe impl Plain for KbootInfo {}

#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct KbootCmdline {
    /// Length of the command line, not counting the terminating NUL
    pub length: u64,
    pub cmdline: [u8; CMDLINE_CAPACITY],
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KbootFramebuffer {
    pub width: u32,
    pub height: u32,
    pub address: u64,
}

/// Location of the firmware memory map, passed through untranslated
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KbootMmap {
    pub descriptors: u64,
    pub descriptor_size: u64,
    pub count: u64,
}

unsafe impl Plain for KbootMmap {}

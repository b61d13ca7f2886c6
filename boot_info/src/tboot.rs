//! The tboot protocol.
//!
//! A tboot kernel is entered with [`MAGIC`] in the first argument register and the physical address
//! of a [`TbootInfo`] in the second. Optional parts of the info block are only valid when the
//! matching [`TbootFlags`] bit is set.

use core::slice;

use bitflags::bitflags;
use plain::Plain;
use x86_64::PhysAddr;

use crate::{MemoryMapEntry, PixelFormat};

/// Value passed in the first argument register when entering a tboot kernel
pub const MAGIC: u64 = 0x7B00_7B00;

bitflags! {
    /// Which parts of a [`TbootInfo`] are populated
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct TbootFlags: u32 {
        const CMDLINE = 1 << 0;
        const MODULES = 1 << 1;
        const TSC_FREQ = 1 << 2;
        const RSDP = 1 << 3;
        const FRAMEBUFFER = 1 << 4;
        const MMAP = 1 << 5;
    }
}

unsafe impl Plain for TbootFlags {}

/// Information block handed to a tboot kernel
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct TbootInfo {
    pub flags: TbootFlags,
    _reserved: u32,
    pub cmdline: TbootCmdline,
    pub modules: TbootModules,
    /// Timestamp counter ticks per second
    pub tsc_freq: u64,
    /// Physical address of a copy of the RSDP
    pub rsdp: u64,
    pub framebuffer: TbootFramebuffer,
    pub mmap: TbootMmap,
}

impl TbootInfo {
    pub fn rsdp(&self) -> Option<PhysAddr> {
        self.flags
            .contains(TbootFlags::RSDP)
            .then(|| PhysAddr::new(self.rsdp))
    }

    pub fn tsc_frequency(&self) -> Option<u64> {
        self.flags
            .contains(TbootFlags::TSC_FREQ)
            .then_some(self.tsc_freq)
    }

    pub fn framebuffer(&self) -> Option<&TbootFramebuffer> {
        self.flags
            .contains(TbootFlags::FRAMEBUFFER)
            .then_some(&self.framebuffer)
    }

    /// # Safety
    /// Physical memory must be identity-mapped and the command line must not have been
    /// overwritten.
    pub unsafe fn command_line(&self) -> Option<&'static [u8]> {
        if !self.flags.contains(TbootFlags::CMDLINE) {
            return None;
        }
        Some(raw_slice(self.cmdline.cmdline, self.cmdline.length))
    }

    /// # Safety
    /// Physical memory must be identity-mapped and the module table must not have been overwritten.
    pub unsafe fn modules(&self) -> &'static [TbootModule] {
        if !self.flags.contains(TbootFlags::MODULES) {
            return &[];
        }
        raw_slice(self.modules.entries, self.modules.count)
    }

    /// # Safety
    /// Physical memory must be identity-mapped and the memory map must not have been overwritten.
    pub unsafe fn memory_map(&self) -> &'static [MemoryMapEntry] {
        if !self.flags.contains(TbootFlags::MMAP) {
            return &[];
        }
        raw_slice(self.mmap.entries, self.mmap.count)
    }
}

unsafe impl Plain for TbootInfo {}

unsafe fn raw_slice<T>(address: u64, count: u64) -> &'static [T] {
    if address == 0 || count == 0 {
        &[]
    } else {
        slice::from_raw_parts(address as usize as *const T, count as usize)
    }
}

/// NUL-terminated command line stored outside the info block
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TbootCmdline {
    /// Length in bytes, not counting the NUL
    pub length: u64,
    pub cmdline: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TbootModules {
    pub count: u64,
    pub entries: u64,
}

/// A file loaded alongside the kernel
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TbootModule {
    pub base: u64,
    pub length: u64,
    /// NUL-terminated tag from the boot entry
    pub name: u64,
}

impl TbootModule {
    pub fn base(&self) -> PhysAddr {
        PhysAddr::new(self.base)
    }

    /// # Safety
    /// Physical memory must be identity-mapped and the module must not have been overwritten.
    pub unsafe fn contents(&self) -> &'static [u8] {
        raw_slice(self.base, self.length)
    }
}

unsafe impl Plain for TbootModule {}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TbootFramebuffer {
    pub address: u64,
    pub width: u32,
    pub height: u32,
    /// Pixels per scan line
    pub pitch: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TbootMmap {
    pub count: u64,
    pub entries: u64,
}

unsafe impl Plain for TbootMmap {}

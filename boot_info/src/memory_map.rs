use core::fmt;

use plain::Plain;
use x86_64::PhysAddr;

/// Type of a translated memory map entry.
///
/// The fixed types occupy the low values. Each boot module gets its own type starting at
/// [`MemoryType::module`]`(0)`, and the range above that is left for the kernel to tag its own
/// allocations.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MemoryType(pub u32);

impl MemoryType {
    pub const USABLE: MemoryType = MemoryType(0);
    pub const RESERVED: MemoryType = MemoryType(1);
    pub const ACPI_RECLAIM: MemoryType = MemoryType(2);
    pub const ACPI_NVS: MemoryType = MemoryType(3);
    pub const BAD_MEMORY: MemoryType = MemoryType(4);
    /// Kernel code and data loaded from the image's segments
    pub const KERNEL: MemoryType = MemoryType(5);
    /// The boot info block and everything it points to
    pub const BOOT_INFO: MemoryType = MemoryType(6);

    const MODULE_BASE: u32 = 0x1000;
    const KERNEL_RESERVED_BASE: u32 = 0x2000;
    const INDEX_MASK: u32 = 0xfff;

    /// Number of distinct module types available
    pub const MAX_MODULES: usize = (Self::KERNEL_RESERVED_BASE - Self::MODULE_BASE) as usize;

    /// Type for the memory holding the `index`th boot module
    pub const fn module(index: u32) -> MemoryType {
        MemoryType(Self::MODULE_BASE + (index & Self::INDEX_MASK))
    }

    /// Type in the range the loader never emits, free for the kernel's own bookkeeping
    pub const fn kernel_reserved(index: u32) -> MemoryType {
        MemoryType(Self::KERNEL_RESERVED_BASE + (index & Self::INDEX_MASK))
    }

    pub fn module_index(self) -> Option<u32> {
        if (Self::MODULE_BASE..Self::KERNEL_RESERVED_BASE).contains(&self.0) {
            Some(self.0 - Self::MODULE_BASE)
        } else {
            None
        }
    }

    pub fn kernel_reserved_index(self) -> Option<u32> {
        let end = Self::KERNEL_RESERVED_BASE + Self::MAX_MODULES as u32;
        if (Self::KERNEL_RESERVED_BASE..end).contains(&self.0) {
            Some(self.0 - Self::KERNEL_RESERVED_BASE)
        } else {
            None
        }
    }

    /// Whether the kernel may use this memory once it no longer needs anything the loader left
    /// there
    pub fn is_usable(self) -> bool {
        self == MemoryType::USABLE
    }
}

impl fmt::Debug for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MemoryType::USABLE => f.write_str("Usable"),
            MemoryType::RESERVED => f.write_str("Reserved"),
            MemoryType::ACPI_RECLAIM => f.write_str("AcpiReclaim"),
            MemoryType::ACPI_NVS => f.write_str("AcpiNvs"),
            MemoryType::BAD_MEMORY => f.write_str("BadMemory"),
            MemoryType::KERNEL => f.write_str("Kernel"),
            MemoryType::BOOT_INFO => f.write_str("BootInfo"),
            other => match (other.module_index(), other.kernel_reserved_index()) {
                (Some(index), _) => write!(f, "Module({})", index),
                (_, Some(index)) => write!(f, "KernelReserved({})", index),
                _ => write!(f, "MemoryType({:#x})", other.0),
            },
        }
    }
}

unsafe impl Plain for MemoryType {}

/// A contiguous range of physical memory of a single type
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub ty: MemoryType,
    _reserved: u32,
}

impl MemoryMapEntry {
    pub const fn new(base: u64, length: u64, ty: MemoryType) -> MemoryMapEntry {
        MemoryMapEntry {
            base,
            length,
            ty,
            _reserved: 0,
        }
    }

    pub fn start_address(&self) -> PhysAddr {
        PhysAddr::new(self.base)
    }

    /// Address one past the end of this entry
    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn page_count(&self) -> u64 {
        self.length / 4096
    }
}

impl fmt::Display for MemoryMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:#010x} - {:#010x}: {:?}, {} pages",
            self.base,
            self.end(),
            self.ty,
            self.page_count()
        )
    }
}

unsafe impl Plain for MemoryMapEntry {}

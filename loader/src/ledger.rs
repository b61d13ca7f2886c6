//! Record of the memory the loader hands over to the kernel.
//!
//! Firmware only knows the four [`MemoryClass`]es. The ledger remembers which owner each
//! allocation belongs to, so the final memory map can tell the kernel apart from the boot info
//! block and from each individual module.

use alloc::vec::Vec;
use core::fmt;

use log::trace;
use tomatboot_boot_info::MemoryType;

use crate::error::BootError;
use crate::firmware::{Firmware, MemoryClass, Placement};
use crate::util::PAGE_SIZE;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Owner {
    Kernel,
    BootInfo,
    /// The boot module with this index
    Module(u32),
}

impl Owner {
    /// Type this owner's memory gets in the translated memory map
    pub fn memory_type(self) -> MemoryType {
        match self {
            Owner::Kernel => MemoryType::KERNEL,
            Owner::BootInfo => MemoryType::BOOT_INFO,
            Owner::Module(index) => MemoryType::module(index),
        }
    }

    fn default_class(self) -> MemoryClass {
        match self {
            Owner::Kernel => MemoryClass::ImageData,
            Owner::BootInfo => MemoryClass::BootInfo,
            Owner::Module(_) => MemoryClass::Module,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Owner::Kernel => f.write_str("the kernel"),
            Owner::BootInfo => f.write_str("boot info"),
            Owner::Module(index) => write!(f, "module {}", index),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub base: u64,
    pub pages: usize,
    pub owner: Owner,
}

impl Allocation {
    pub fn end(&self) -> u64 {
        self.base + self.pages as u64 * PAGE_SIZE
    }
}

/// Page allocations made on behalf of the kernel, kept sorted by address
#[derive(Debug, Default)]
pub struct Arena {
    allocations: Vec<Allocation>,
}

impl Arena {
    pub fn new() -> Arena {
        Arena::default()
    }

    /// Allocates `pages` pages at exactly `address`
    pub fn allocate_at<F: Firmware>(
        &mut self,
        firmware: &mut F,
        owner: Owner,
        class: MemoryClass,
        address: u64,
        pages: usize,
    ) -> Result<u64, BootError> {
        let base = firmware
            .allocate_pages(Placement::Fixed(address), class, pages)
            .map_err(|status| BootError::Placement {
                owner,
                address,
                pages,
                status,
            })?;
        self.record(Allocation { base, pages, owner });
        Ok(base)
    }

    /// Allocates `pages` pages wherever the firmware likes
    pub fn allocate<F: Firmware>(
        &mut self,
        firmware: &mut F,
        owner: Owner,
        pages: usize,
    ) -> Result<u64, BootError> {
        let base = firmware
            .allocate_pages(Placement::Anywhere, owner.default_class(), pages)
            .map_err(|status| BootError::Allocation {
                owner,
                pages,
                status,
            })?;
        self.record(Allocation { base, pages, owner });
        Ok(base)
    }

    /// Like [`Arena::allocate`], but the pages are zeroed
    pub fn allocate_zeroed<F: Firmware>(
        &mut self,
        firmware: &mut F,
        owner: Owner,
        pages: usize,
    ) -> Result<u64, BootError> {
        let base = self.allocate(firmware, owner, pages)?;
        unsafe { firmware.physical_memory(base, pages * PAGE_SIZE as usize) }.fill(0);
        Ok(base)
    }

    /// Returns the allocation starting at `base` to the firmware
    pub fn release<F: Firmware>(&mut self, firmware: &mut F, base: u64) -> Result<(), BootError> {
        let index = match self.allocations.binary_search_by_key(&base, |a| a.base) {
            Ok(index) => index,
            // Not ours, so there is nothing to give back
            Err(_) => return Ok(()),
        };

        let pages = self.allocations[index].pages;
        firmware
            .free_pages(base, pages)
            .map_err(|status| BootError::Release {
                address: base,
                pages,
                status,
            })?;
        self.allocations.remove(index);
        Ok(())
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Allocations overlapping `[start, end)`, in address order
    pub fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = &Allocation> {
        let first = self.allocations.partition_point(|a| a.end() <= start);
        self.allocations[first..]
            .iter()
            .take_while(move |a| a.base < end)
    }

    fn record(&mut self, allocation: Allocation) {
        trace!(
            "{} pages at {:#x} belong to {}",
            allocation.pages,
            allocation.base,
            allocation.owner
        );
        let index = self.allocations.partition_point(|a| a.base < allocation.base);
        self.allocations.insert(index, allocation);
    }
}

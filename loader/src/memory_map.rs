//! Translation of the firmware memory map into boot info memory map entries.
//!
//! Firmware types are folded into the handful of types the kernel cares about. Memory the loader
//! allocated is split by owner using the [`Arena`], and contiguous entries of the same type are
//! merged as they are written, so translation never needs more than one pass or any memory beyond
//! its output.

use core::mem;
use core::ptr;

use thiserror::Error;
use tomatboot_boot_info::{MemoryMapEntry, MemoryType};
use uefi::boot::MemoryType as FirmwareType;
use uefi::mem::memory_map::MemoryDescriptor;

use crate::firmware::MemoryClass;
use crate::ledger::Arena;
use crate::util::PAGE_SIZE;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("memory map does not fit in {capacity} entries")]
pub struct MapOverflow {
    pub capacity: usize,
}

/// A memory map as written by the firmware
#[derive(Debug, Copy, Clone)]
pub struct RawMemoryMap<'a> {
    /// Physical address of the descriptor buffer
    pub address: u64,
    /// The filled part of the buffer
    pub bytes: &'a [u8],
    pub descriptor_size: usize,
}

impl<'a> RawMemoryMap<'a> {
    pub fn len(&self) -> usize {
        self.descriptors().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptors(&self) -> Descriptors<'a> {
        Descriptors::new(self.bytes, self.descriptor_size)
    }
}

/// Iterates over firmware descriptors stored `stride` bytes apart.
///
/// The stride is whatever the firmware reported and may be larger than [`MemoryDescriptor`].
pub struct Descriptors<'a> {
    buffer: &'a [u8],
    stride: usize,
    remaining: usize,
}

impl<'a> Descriptors<'a> {
    pub fn new(buffer: &'a [u8], stride: usize) -> Descriptors<'a> {
        let remaining = if stride >= mem::size_of::<MemoryDescriptor>() {
            buffer.len() / stride
        } else {
            0
        };
        Descriptors {
            buffer,
            stride,
            remaining,
        }
    }
}

impl Iterator for Descriptors<'_> {
    type Item = MemoryDescriptor;

    fn next(&mut self) -> Option<MemoryDescriptor> {
        if self.remaining == 0 {
            return None;
        }
        let (current, rest) = self.buffer.split_at(self.stride);
        self.buffer = rest;
        self.remaining -= 1;
        // Firmware only promises byte alignment for the buffer contents
        let descriptor = current.as_ptr().cast::<MemoryDescriptor>();
        Some(unsafe { ptr::read_unaligned(descriptor) })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Descriptors<'_> {}

/// Maps a firmware memory type that the loader did not allocate to its boot info type
pub fn classify(ty: FirmwareType) -> MemoryType {
    match ty {
        FirmwareType::CONVENTIONAL
        | FirmwareType::LOADER_CODE
        | FirmwareType::LOADER_DATA
        | FirmwareType::BOOT_SERVICES_CODE
        | FirmwareType::BOOT_SERVICES_DATA => MemoryType::USABLE,
        FirmwareType::ACPI_RECLAIM => MemoryType::ACPI_RECLAIM,
        FirmwareType::ACPI_NON_VOLATILE => MemoryType::ACPI_NVS,
        FirmwareType::UNUSABLE => MemoryType::BAD_MEMORY,
        _ => MemoryType::RESERVED,
    }
}

/// Number of entries translating `descriptors` firmware descriptors may produce, given the
/// allocations in `arena`. Each allocation can split one descriptor into at most three entries.
pub fn translated_capacity(descriptors: usize, arena: &Arena) -> usize {
    descriptors + 2 * arena.allocations().len()
}

/// Appends entries to a fixed buffer, merging each one into the previous entry when they touch and
/// share a type
pub struct MemoryMapWriter<'a> {
    entries: &'a mut [MemoryMapEntry],
    len: usize,
}

impl<'a> MemoryMapWriter<'a> {
    pub fn new(entries: &'a mut [MemoryMapEntry]) -> MemoryMapWriter<'a> {
        MemoryMapWriter { entries, len: 0 }
    }

    pub fn push(&mut self, base: u64, length: u64, ty: MemoryType) -> Result<(), MapOverflow> {
        if let Some(previous) = self.len.checked_sub(1).map(|last| &mut self.entries[last]) {
            if previous.ty == ty && previous.end() == base {
                previous.length += length;
                return Ok(());
            }
        }

        let slot = self
            .entries
            .get_mut(self.len)
            .ok_or(MapOverflow { capacity: self.len })?;
        *slot = MemoryMapEntry::new(base, length, ty);
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Translates `descriptors` into `out`, returning how many entries were written.
///
/// Descriptors are expected in ascending address order, as firmware reports them. A descriptor
/// reaching past the top of the address space is cut off there.
pub fn translate(
    descriptors: impl Iterator<Item = MemoryDescriptor>,
    arena: &Arena,
    out: &mut [MemoryMapEntry],
) -> Result<usize, MapOverflow> {
    let mut writer = MemoryMapWriter::new(out);

    for descriptor in descriptors {
        let start = descriptor.phys_start;
        let end = start.saturating_add(descriptor.page_count.saturating_mul(PAGE_SIZE));

        if MemoryClass::from_memory_type(descriptor.ty).is_some() {
            split_by_owner(&mut writer, arena, start, end)?;
        } else {
            writer.push(start, end - start, classify(descriptor.ty))?;
        }
    }

    Ok(writer.len())
}

/// Emits one entry per owner for a range the loader allocated. Parts the ledger has no record of
/// are reported as reserved.
fn split_by_owner(
    writer: &mut MemoryMapWriter,
    arena: &Arena,
    start: u64,
    end: u64,
) -> Result<(), MapOverflow> {
    let mut cursor = start;

    for allocation in arena.overlapping(start, end) {
        let piece_start = allocation.base.max(start);
        let piece_end = allocation.end().min(end);
        if piece_start > cursor {
            writer.push(cursor, piece_start - cursor, MemoryType::RESERVED)?;
        }
        let ty = allocation.owner.memory_type();
        writer.push(piece_start, piece_end - piece_start, ty)?;
        cursor = piece_end;
    }

    if cursor < end || start == end {
        writer.push(cursor, end - cursor, MemoryType::RESERVED)?;
    }
    Ok(())
}

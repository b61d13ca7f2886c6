//! Simulated firmware and image construction for host tests

use std::collections::BTreeMap;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use plain::Plain;
use tomatboot_boot_info::PixelFormat;
use uefi::boot::MemoryType as FirmwareType;
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor};
use uefi::{Guid, Status};

use crate::firmware::{
    ConfigTable, DisplayMode, ExitError, FileHandle, Firmware, MapError, MapKey, MapSize,
    MapSnapshot, MemoryClass, Placement,
};
use crate::util::PAGE_SIZE;

/// Byte freshly allocated simulated memory is filled with
pub const GARBAGE: u8 = 0xaa;

/// Simulated RAM covers physical addresses below this
const RAM_END: u64 = 0x800_0000;

/// Timestamp ticks per microsecond
pub const TICKS_PER_MICRO: u64 = 2_500;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Region {
    base: u64,
    end: u64,
    ty: FirmwareType,
}

pub struct SimFirmware {
    regions: Vec<Region>,
    ram: NonNull<u8>,
    files: BTreeMap<String, Vec<u8>>,
    tables: Vec<ConfigTable>,
    display: Option<DisplayMode>,
    descriptor_size: usize,
    key: usize,
    tsc: u64,

    stale_exits: usize,
    exit_failure: Option<Status>,
    growth_on_exit: usize,

    exited: bool,
    exit_calls: usize,
    console_released: bool,
    interrupts_disabled: bool,
    allocation_count: usize,
    freed: Vec<(u64, usize)>,
}

impl SimFirmware {
    pub fn new() -> SimFirmware {
        let layout = [
            (0x0, 0x1000, FirmwareType::BOOT_SERVICES_DATA),
            (0x1000, 0x9_f000, FirmwareType::CONVENTIONAL),
            (0x9_f000, 0x10_0000, FirmwareType::RESERVED),
            (0x10_0000, 0x80_0000, FirmwareType::CONVENTIONAL),
            (0x80_0000, 0x82_0000, FirmwareType::LOADER_CODE),
            (0x82_0000, 0x400_0000, FirmwareType::CONVENTIONAL),
            (0x400_0000, 0x401_0000, FirmwareType::ACPI_RECLAIM),
            (0x401_0000, 0x402_0000, FirmwareType::ACPI_NON_VOLATILE),
            (0x402_0000, 0x800_0000, FirmwareType::CONVENTIONAL),
            (0xfec0_0000, 0xfec0_1000, FirmwareType::MMIO),
        ];

        // Zeroed allocations are lazily backed by the host, so untouched RAM costs nothing
        let words = Box::leak(vec![0u64; RAM_END as usize / 8].into_boxed_slice());

        SimFirmware {
            regions: layout
                .iter()
                .map(|&(base, end, ty)| Region { base, end, ty })
                .collect(),
            ram: NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap(),
            files: BTreeMap::new(),
            tables: Vec::new(),
            display: None,
            descriptor_size: 48,
            key: 1,
            tsc: 0x1_0000,
            stale_exits: 0,
            exit_failure: None,
            growth_on_exit: 0,
            exited: false,
            exit_calls: 0,
            console_released: false,
            interrupts_disabled: false,
            allocation_count: 0,
            freed: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: &str, contents: Vec<u8>) {
        self.files.insert(path.to_string(), contents);
    }

    /// Places `bytes` at `address` and publishes it in the configuration table under `guid`
    pub fn add_config_table(&mut self, guid: Guid, address: u64, bytes: &[u8]) {
        self.install(address, bytes);
        self.tables.push(ConfigTable { guid, address });
    }

    pub fn set_display(&mut self, display: DisplayMode) {
        self.display = Some(display);
    }

    /// The next `count` exit attempts fail as if the memory map changed underneath them
    pub fn fail_exits_with_stale_key(&mut self, count: usize) {
        self.stale_exits = count;
    }

    pub fn fail_exits_with(&mut self, status: Status) {
        self.exit_failure = Some(status);
    }

    /// Firmware claims this many extra pages while exiting, one descriptor each
    pub fn grow_map_on_exit(&mut self, pages: usize) {
        self.growth_on_exit = pages;
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn exit_calls(&self) -> usize {
        self.exit_calls
    }

    pub fn console_released(&self) -> bool {
        self.console_released
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.interrupts_disabled
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    pub fn freed(&self) -> &[(u64, usize)] {
        &self.freed
    }

    pub fn region_type(&self, address: u64) -> Option<FirmwareType> {
        self.regions
            .iter()
            .find(|r| r.base <= address && address < r.end)
            .map(|r| r.ty)
    }

    /// The memory map as the firmware would report it right now
    pub fn descriptors(&self) -> Vec<MemoryDescriptor> {
        self.regions
            .iter()
            .map(|region| MemoryDescriptor {
                ty: region.ty,
                phys_start: region.base,
                virt_start: 0,
                page_count: (region.end - region.base) / PAGE_SIZE,
                att: MemoryAttribute::WRITE_BACK,
            })
            .collect()
    }

    pub fn bytes(&mut self, address: u64, len: usize) -> Vec<u8> {
        unsafe { self.physical_memory(address, len) }.to_vec()
    }

    pub fn read<T: Plain + Default>(&mut self, address: u64) -> T {
        let mut value = T::default();
        value
            .copy_from_bytes(&self.bytes(address, mem::size_of::<T>()))
            .unwrap();
        value
    }

    pub fn read_slice<T: Plain + Default + Clone>(
        &mut self,
        address: u64,
        count: usize,
    ) -> Vec<T> {
        let bytes = self.bytes(address, count * mem::size_of::<T>());
        let mut values = vec![T::default(); count];
        for (value, chunk) in values.iter_mut().zip(bytes.chunks(mem::size_of::<T>())) {
            value.copy_from_bytes(chunk).unwrap();
        }
        values
    }

    /// Reads a NUL-terminated string
    pub fn c_string(&mut self, address: u64) -> String {
        let mut text = String::new();
        for offset in 0.. {
            match self.bytes(address + offset, 1)[0] {
                0 => break,
                byte => text.push(byte as char),
            }
        }
        text
    }

    fn install(&mut self, address: u64, bytes: &[u8]) {
        unsafe { self.physical_memory(address, bytes.len()) }.copy_from_slice(bytes);
    }

    fn is_free(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        for region in &self.regions {
            if region.end <= cursor {
                continue;
            }
            if region.base > cursor || region.ty != FirmwareType::CONVENTIONAL {
                return false;
            }
            cursor = region.end;
            if cursor >= end {
                return true;
            }
        }
        false
    }

    fn highest_free(&self, length: u64) -> Option<u64> {
        self.regions
            .iter()
            .rev()
            .find(|r| r.ty == FirmwareType::CONVENTIONAL && r.end - r.base >= length)
            .map(|r| r.end - length)
    }

    fn set_type(&mut self, start: u64, end: u64, ty: FirmwareType) {
        let mut split = Vec::new();
        for region in &self.regions {
            if region.end <= start || region.base >= end {
                split.push(*region);
                continue;
            }
            if region.base < start {
                split.push(Region {
                    end: start,
                    ..*region
                });
            }
            split.push(Region {
                base: region.base.max(start),
                end: region.end.min(end),
                ty,
            });
            if region.end > end {
                split.push(Region {
                    base: end,
                    ..*region
                });
            }
        }

        let mut merged: Vec<Region> = Vec::new();
        for region in split {
            match merged.last_mut() {
                Some(last) if last.ty == region.ty && last.end == region.base => {
                    last.end = region.end
                }
                _ => merged.push(region),
            }
        }
        self.regions = merged;
        self.key += 1;
    }

    fn assert_boot_services(&self, service: &str) {
        assert!(!self.exited, "{} called after boot services were exited", service);
    }
}

impl Firmware for SimFirmware {
    type File = SimFile;

    fn open(&mut self, path: &str) -> Result<SimFile, Status> {
        self.assert_boot_services("open");
        let data = self.files.get(path).cloned().ok_or(Status::NOT_FOUND)?;
        Ok(SimFile { data, position: 0 })
    }

    fn allocate_pages(
        &mut self,
        placement: Placement,
        class: MemoryClass,
        pages: usize,
    ) -> Result<u64, Status> {
        self.assert_boot_services("allocate_pages");
        if pages == 0 {
            return Err(Status::INVALID_PARAMETER);
        }

        let length = pages as u64 * PAGE_SIZE;
        let base = match placement {
            Placement::Fixed(address) if address % PAGE_SIZE != 0 => {
                return Err(Status::INVALID_PARAMETER)
            }
            Placement::Fixed(address) if !self.is_free(address, address + length) => {
                return Err(Status::NOT_FOUND)
            }
            Placement::Fixed(address) => address,
            Placement::Anywhere => self
                .highest_free(length)
                .ok_or(Status::OUT_OF_RESOURCES)?,
        };

        self.set_type(base, base + length, class.memory_type());
        unsafe { self.physical_memory(base, length as usize) }.fill(GARBAGE);
        self.allocation_count += 1;
        Ok(base)
    }

    fn free_pages(&mut self, base: u64, pages: usize) -> Result<(), Status> {
        self.assert_boot_services("free_pages");
        match self.region_type(base) {
            Some(ty) if MemoryClass::from_memory_type(ty).is_some() => (),
            _ => return Err(Status::NOT_FOUND),
        }

        let end = base + pages as u64 * PAGE_SIZE;
        self.set_type(base, end, FirmwareType::CONVENTIONAL);
        self.freed.push((base, pages));
        Ok(())
    }

    unsafe fn physical_memory(&mut self, base: u64, len: usize) -> &'static mut [u8] {
        assert!(
            base + len as u64 <= RAM_END,
            "no memory behind {:#x}+{:#x}",
            base,
            len
        );
        slice::from_raw_parts_mut(self.ram.as_ptr().add(base as usize), len)
    }

    fn memory_map_size(&mut self) -> MapSize {
        MapSize {
            map_size: self.regions.len() * self.descriptor_size,
            descriptor_size: self.descriptor_size,
        }
    }

    fn memory_map(&mut self, buffer: &mut [u8]) -> Result<MapSnapshot, MapError> {
        let required = self.regions.len() * self.descriptor_size;
        if buffer.len() < required {
            return Err(MapError::BufferTooSmall { required });
        }

        let chunks = buffer.chunks_mut(self.descriptor_size);
        for (descriptor, chunk) in self.descriptors().into_iter().zip(chunks) {
            chunk.fill(0);
            let slot = chunk.as_mut_ptr().cast::<MemoryDescriptor>();
            unsafe { ptr::write_unaligned(slot, descriptor) };
        }
        Ok(MapSnapshot {
            len: required,
            descriptor_size: self.descriptor_size,
            key: MapKey(self.key),
        })
    }

    unsafe fn exit_boot_services(&mut self, key: MapKey) -> Result<(), ExitError> {
        self.exit_calls += 1;
        self.assert_boot_services("exit_boot_services");

        if let Some(status) = self.exit_failure {
            return Err(ExitError::Firmware(status));
        }
        if self.stale_exits > 0 {
            self.stale_exits -= 1;
            self.key += 1;
            return Err(ExitError::StaleKey);
        }
        if key != MapKey(self.key) {
            return Err(ExitError::StaleKey);
        }

        for _ in 0..self.growth_on_exit {
            if let Some(base) = self.highest_free(PAGE_SIZE) {
                self.set_type(base, base + PAGE_SIZE, FirmwareType::RUNTIME_SERVICES_DATA);
                // Keep the next page from merging with this one
                if let Some(gap) = self.highest_free(PAGE_SIZE) {
                    self.set_type(gap, gap + PAGE_SIZE, FirmwareType::BOOT_SERVICES_DATA);
                }
            }
        }
        self.exited = true;
        Ok(())
    }

    fn boot_services_exited(&mut self) {
        self.console_released = true;
    }

    fn disable_interrupts(&mut self) {
        assert!(
            self.exited,
            "interrupts disabled while boot services are still active"
        );
        self.interrupts_disabled = true;
    }

    fn config_tables(&mut self) -> Vec<ConfigTable> {
        self.assert_boot_services("config_tables");
        self.tables.clone()
    }

    fn display_mode(&mut self) -> Option<DisplayMode> {
        self.assert_boot_services("display_mode");
        self.display
    }

    fn stall(&mut self, micros: usize) {
        self.assert_boot_services("stall");
        self.tsc += micros as u64 * TICKS_PER_MICRO;
    }

    fn timestamp(&mut self) -> u64 {
        self.tsc
    }

    fn halt(&mut self) -> ! {
        panic!("halted");
    }

    unsafe fn jump(&mut self, entry: u64, magic: u64, info: u64) -> ! {
        assert!(
            self.interrupts_disabled,
            "kernel entered with interrupts enabled"
        );
        panic!(
            "jumped to {:#x} with magic {:#x} and boot info at {:#x}",
            entry, magic, info
        );
    }
}

impl Drop for SimFirmware {
    fn drop(&mut self) {
        let words =
            ptr::slice_from_raw_parts_mut(self.ram.as_ptr().cast::<u64>(), RAM_END as usize / 8);
        drop(unsafe { Box::from_raw(words) });
    }
}

pub struct SimFile {
    data: Vec<u8>,
    position: usize,
}

impl FileHandle for SimFile {
    fn size(&mut self) -> Result<u64, Status> {
        Ok(self.data.len() as u64)
    }

    fn set_position(&mut self, offset: u64) -> Result<(), Status> {
        self.position = offset as usize;
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Status> {
        let available = self.data.get(self.position..).unwrap_or(&[]);
        // Hand out data in small pieces so callers have to loop
        let count = buffer.len().min(available.len()).min(512);
        buffer[..count].copy_from_slice(&available[..count]);
        self.position += count;
        Ok(count)
    }
}

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;

struct Segment {
    ty: u32,
    address: u64,
    flags: u32,
    data: Vec<u8>,
    memory_size: u64,
}

/// Assembles minimal ELF64 executables
pub struct ImageBuilder {
    entry: u64,
    segments: Vec<Segment>,
    sections: Vec<(String, Vec<u8>)>,
    section_table: bool,
}

impl ImageBuilder {
    pub fn new(entry: u64) -> ImageBuilder {
        ImageBuilder {
            entry,
            segments: Vec::new(),
            sections: Vec::new(),
            section_table: true,
        }
    }

    pub fn segment(self, address: u64, flags: u32, data: &[u8], memory_size: u64) -> ImageBuilder {
        self.segment_of_type(1, address, flags, data, memory_size)
    }

    pub fn segment_of_type(
        mut self,
        ty: u32,
        address: u64,
        flags: u32,
        data: &[u8],
        memory_size: u64,
    ) -> ImageBuilder {
        self.segments.push(Segment {
            ty,
            address,
            flags,
            data: data.to_vec(),
            memory_size,
        });
        self
    }

    pub fn section(mut self, name: &str, data: &[u8]) -> ImageBuilder {
        self.sections.push((name.to_string(), data.to_vec()));
        self
    }

    pub fn without_section_table(mut self) -> ImageBuilder {
        self.section_table = false;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; EHDR_SIZE + PHDR_SIZE * self.segments.len()];

        let mut segment_offsets = Vec::new();
        for segment in &self.segments {
            align(&mut image, 16);
            segment_offsets.push(image.len());
            image.extend_from_slice(&segment.data);
        }

        // (name offset, type, file offset, size)
        let mut headers = Vec::new();
        let mut names = vec![0u8];
        for (name, data) in &self.sections {
            align(&mut image, 8);
            headers.push((names.len(), 1u32, image.len(), data.len()));
            image.extend_from_slice(data);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        let strtab_name = names.len();
        names.extend_from_slice(b".shstrtab\0");
        headers.push((strtab_name, 3, image.len(), names.len()));
        image.extend_from_slice(&names);

        align(&mut image, 8);
        let section_offset = image.len();
        image.extend_from_slice(&[0u8; SHDR_SIZE]);
        for &(name, ty, offset, size) in &headers {
            let mut header = [0u8; SHDR_SIZE];
            put(&mut header, 0, &(name as u32).to_le_bytes());
            put(&mut header, 4, &ty.to_le_bytes());
            put(&mut header, 24, &(offset as u64).to_le_bytes());
            put(&mut header, 32, &(size as u64).to_le_bytes());
            image.extend_from_slice(&header);
        }
        let section_count = headers.len() as u16 + 1;

        put(&mut image, 0, &[0x7f, b'E', b'L', b'F', 2, 1, 1]);
        put(&mut image, 16, &2u16.to_le_bytes());
        put(&mut image, 18, &0x3eu16.to_le_bytes());
        put(&mut image, 20, &1u32.to_le_bytes());
        put(&mut image, 24, &self.entry.to_le_bytes());
        put(&mut image, 32, &(EHDR_SIZE as u64).to_le_bytes());
        put(&mut image, 52, &(EHDR_SIZE as u16).to_le_bytes());
        put(&mut image, 54, &(PHDR_SIZE as u16).to_le_bytes());
        put(&mut image, 56, &(self.segments.len() as u16).to_le_bytes());
        put(&mut image, 58, &(SHDR_SIZE as u16).to_le_bytes());
        if self.section_table {
            put(&mut image, 40, &(section_offset as u64).to_le_bytes());
            put(&mut image, 60, &section_count.to_le_bytes());
            put(&mut image, 62, &(section_count - 1).to_le_bytes());
        }

        let placed = self.segments.iter().zip(&segment_offsets);
        for (index, (segment, &offset)) in placed.enumerate() {
            let header = EHDR_SIZE + index * PHDR_SIZE;
            put(&mut image, header, &segment.ty.to_le_bytes());
            put(&mut image, header + 4, &segment.flags.to_le_bytes());
            put(&mut image, header + 8, &(offset as u64).to_le_bytes());
            put(&mut image, header + 16, &segment.address.to_le_bytes());
            put(&mut image, header + 24, &segment.address.to_le_bytes());
            put(&mut image, header + 32, &(segment.data.len() as u64).to_le_bytes());
            put(&mut image, header + 40, &segment.memory_size.to_le_bytes());
            put(&mut image, header + 48, &PAGE_SIZE.to_le_bytes());
        }

        image
    }
}

/// Bytes of a `.kboot.header` section requesting `mapping_type`
pub fn kboot_header(mapping_type: u32) -> Vec<u8> {
    let mut header = vec![0u8; 16];
    put(&mut header, 0, &mapping_type.to_le_bytes());
    header
}

fn align(image: &mut Vec<u8>, to: usize) {
    let padded = (image.len() + to - 1) / to * to;
    image.resize(padded, 0);
}

fn put(buffer: &mut [u8], offset: usize, bytes: &[u8]) {
    buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// A 1024x768 BGR display with its framebuffer at `base`
pub fn display(base: u64) -> DisplayMode {
    DisplayMode {
        base,
        width: 1024,
        height: 768,
        stride: 1024,
        format: PixelFormat::BGR_RESERVED_8,
    }
}

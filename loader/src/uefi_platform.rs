//! [`Firmware`] on top of UEFI boot services

use alloc::vec::Vec;
use core::arch::x86_64::_rdtsc;
use core::mem;
use core::ptr::{self, NonNull};
use core::slice;

use log::{debug, warn};
use tomatboot::firmware::{
    ConfigTable, DisplayMode, ExitError, FileHandle, Firmware, MapError, MapKey, MapSize,
    MapSnapshot, MemoryClass, Placement,
};
use tomatboot_boot_info::PixelFormat;
use uefi::boot::{self, AllocateType, OpenProtocolAttributes, OpenProtocolParams, ScopedProtocol};
use uefi::mem::memory_map::MemoryDescriptor;
use uefi::proto::console::gop::{self, GraphicsOutput};
use uefi::proto::media::file::{Directory, File, FileAttribute, FileInfo, FileMode, RegularFile};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::{system, table, CStr16, Status};
use x86_64::instructions::interrupts;
use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

/// UEFI paths are UCS-2 and at most this long, including the terminator
const PATH_CAPACITY: usize = 256;

pub struct UefiFirmware {
    volume: Option<ScopedProtocol<SimpleFileSystem>>,
    root: Option<Directory>,
}

impl UefiFirmware {
    pub fn new() -> UefiFirmware {
        UefiFirmware {
            volume: None,
            root: None,
        }
    }

    /// Root directory of the volume this image was loaded from
    fn root(&mut self) -> Result<&mut Directory, Status> {
        if self.root.is_none() {
            let mut volume =
                boot::get_image_file_system(boot::image_handle()).map_err(|e| e.status())?;
            self.root = Some(volume.open_volume().map_err(|e| e.status())?);
            self.volume = Some(volume);
        }
        self.root.as_mut().ok_or(Status::NOT_FOUND)
    }
}

pub struct UefiFile {
    inner: RegularFile,
}

impl FileHandle for UefiFile {
    fn size(&mut self) -> Result<u64, Status> {
        let info = self
            .inner
            .get_boxed_info::<FileInfo>()
            .map_err(|e| e.status())?;
        Ok(info.file_size())
    }

    fn set_position(&mut self, offset: u64) -> Result<(), Status> {
        self.inner.set_position(offset).map_err(|e| e.status())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Status> {
        self.inner.read(buffer).map_err(|e| e.status())
    }
}

impl Firmware for UefiFirmware {
    type File = UefiFile;

    fn open(&mut self, path: &str) -> Result<UefiFile, Status> {
        let mut wide = [0u16; PATH_CAPACITY];
        let mut native = [0u8; PATH_CAPACITY];
        if path.len() >= PATH_CAPACITY {
            return Err(Status::INVALID_PARAMETER);
        }
        for (slot, byte) in native.iter_mut().zip(path.bytes()) {
            *slot = if byte == b'/' { b'\\' } else { byte };
        }
        let native =
            core::str::from_utf8(&native[..path.len()]).map_err(|_| Status::INVALID_PARAMETER)?;
        let name =
            CStr16::from_str_with_buf(native, &mut wide).map_err(|_| Status::INVALID_PARAMETER)?;

        let handle = self
            .root()?
            .open(name, FileMode::Read, FileAttribute::empty())
            .map_err(|e| e.status())?;
        let inner = handle
            .into_regular_file()
            .ok_or(Status::INVALID_PARAMETER)?;
        Ok(UefiFile { inner })
    }

    fn allocate_pages(
        &mut self,
        placement: Placement,
        class: MemoryClass,
        pages: usize,
    ) -> Result<u64, Status> {
        let ty = match placement {
            Placement::Fixed(address) => AllocateType::Address(address),
            Placement::Anywhere => AllocateType::AnyPages,
        };
        let memory =
            boot::allocate_pages(ty, class.memory_type(), pages).map_err(|e| e.status())?;
        Ok(memory.as_ptr() as u64)
    }

    fn free_pages(&mut self, base: u64, pages: usize) -> Result<(), Status> {
        let memory = NonNull::new(base as usize as *mut u8).ok_or(Status::INVALID_PARAMETER)?;
        unsafe { boot::free_pages(memory, pages) }.map_err(|e| e.status())
    }

    unsafe fn physical_memory(&mut self, base: u64, len: usize) -> &'static mut [u8] {
        // Boot services identity map all of physical memory
        slice::from_raw_parts_mut(base as usize as *mut u8, len)
    }

    fn memory_map_size(&mut self) -> MapSize {
        let mut map_size = 0;
        let mut key = 0;
        let mut descriptor_size = 0;
        let mut version = 0;
        // Fails with BUFFER_TOO_SMALL and reports the sizes
        let _ = unsafe {
            get_memory_map(
                &mut map_size,
                ptr::null_mut(),
                &mut key,
                &mut descriptor_size,
                &mut version,
            )
        };
        MapSize {
            map_size,
            descriptor_size: descriptor_size.max(mem::size_of::<MemoryDescriptor>()),
        }
    }

    fn memory_map(&mut self, buffer: &mut [u8]) -> Result<MapSnapshot, MapError> {
        let mut map_size = buffer.len();
        let mut key = 0;
        let mut descriptor_size = 0;
        let mut version = 0;
        let status = unsafe {
            get_memory_map(
                &mut map_size,
                buffer.as_mut_ptr().cast::<MemoryDescriptor>(),
                &mut key,
                &mut descriptor_size,
                &mut version,
            )
        };

        match status {
            Status::SUCCESS => Ok(MapSnapshot {
                len: map_size,
                descriptor_size,
                key: MapKey(key),
            }),
            Status::BUFFER_TOO_SMALL => Err(MapError::BufferTooSmall { required: map_size }),
            status => Err(MapError::Firmware(status)),
        }
    }

    unsafe fn exit_boot_services(&mut self, key: MapKey) -> Result<(), ExitError> {
        let Some(system_table) = table::system_table_raw() else {
            return Err(ExitError::Firmware(Status::NOT_READY));
        };
        let services = &*system_table.as_ref().boot_services;

        // Closing these later would call into boot services
        mem::forget(self.root.take());
        mem::forget(self.volume.take());

        match (services.exit_boot_services)(boot::image_handle().as_ptr(), key.0) {
            Status::SUCCESS => Ok(()),
            Status::INVALID_PARAMETER => Err(ExitError::StaleKey),
            status => Err(ExitError::Firmware(status)),
        }
    }

    fn boot_services_exited(&mut self) {
        tomatboot::logger::boot_services_exited();
    }

    fn disable_interrupts(&mut self) {
        interrupts::disable();
        let empty = DescriptorTablePointer {
            limit: 0,
            base: VirtAddr::new(0),
        };
        unsafe { lidt(&empty) };
    }

    fn config_tables(&mut self) -> Vec<ConfigTable> {
        system::with_config_table(|entries| {
            entries
                .iter()
                .map(|entry| ConfigTable {
                    guid: entry.guid,
                    address: entry.address as u64,
                })
                .collect()
        })
    }

    fn display_mode(&mut self) -> Option<DisplayMode> {
        let handle = boot::get_handle_for_protocol::<GraphicsOutput>().ok()?;
        // Shared access, the firmware console keeps drawing to the same framebuffer
        let mut gop = match unsafe {
            boot::open_protocol::<GraphicsOutput>(
                OpenProtocolParams {
                    handle,
                    agent: boot::image_handle(),
                    controller: None,
                },
                OpenProtocolAttributes::GetProtocol,
            )
        } {
            Ok(gop) => gop,
            Err(e) => {
                warn!("Failed to open graphics output: {:?}", e);
                return None;
            }
        };

        let mode = gop.current_mode_info();
        let format = match mode.pixel_format() {
            gop::PixelFormat::Rgb => PixelFormat::RGB_RESERVED_8,
            gop::PixelFormat::Bgr => PixelFormat::BGR_RESERVED_8,
            gop::PixelFormat::Bitmask => PixelFormat::BITMASK,
            gop::PixelFormat::BltOnly => {
                debug!("Graphics mode has no linear framebuffer");
                return None;
            }
        };
        let (width, height) = mode.resolution();
        let stride = mode.stride();

        Some(DisplayMode {
            base: gop.frame_buffer().as_mut_ptr() as u64,
            width: width as u32,
            height: height as u32,
            stride: stride as u32,
            format,
        })
    }

    fn stall(&mut self, micros: usize) {
        boot::stall(micros);
    }

    fn timestamp(&mut self) -> u64 {
        unsafe { _rdtsc() }
    }

    fn halt(&mut self) -> ! {
        halt_loop()
    }

    unsafe fn jump(&mut self, entry: u64, magic: u64, info: u64) -> ! {
        let kernel: extern "sysv64" fn(u64, u64) -> ! = mem::transmute(entry as usize as *const ());
        kernel(magic, info)
    }
}

/// Raw GetMemoryMap, which unlike the safe wrappers can write into memory the loader placed
/// itself
unsafe fn get_memory_map(
    map_size: &mut usize,
    buffer: *mut MemoryDescriptor,
    key: &mut usize,
    descriptor_size: &mut usize,
    version: &mut u32,
) -> Status {
    match table::system_table_raw() {
        Some(system_table) => {
            let services = &*system_table.as_ref().boot_services;
            (services.get_memory_map)(map_size, buffer, key, descriptor_size, version)
        }
        None => Status::NOT_READY,
    }
}

pub fn halt_loop() -> ! {
    interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

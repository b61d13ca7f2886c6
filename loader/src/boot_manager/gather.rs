use log::{debug, info};

use super::{BootManager, Stage};
use crate::acpi::locate_rsdp;
use crate::config;
use crate::error::BootError;
use crate::firmware::{Firmware, MapError};
use crate::ledger::Owner;
use crate::modules::load_modules;
use crate::protocol::{BootFacts, MapBuffer, Protocol};
use crate::util::{pages_for, PAGE_SIZE};

/// How many times the memory map buffer is resized before giving up
const MAP_RESERVATION_ATTEMPTS: usize = 2;

pub struct ModulesLoaded;

impl Stage for ModulesLoaded {
    const NAME: &'static str = "modules loaded";
}

pub struct AcpiLocated;

impl Stage for AcpiLocated {
    const NAME: &'static str = "ACPI located";
}

pub struct FramebufferDescribed;

impl Stage for FramebufferDescribed {
    const NAME: &'static str = "framebuffer described";
}

pub struct HandoffReady<T> {
    pub(super) info: u64,
    pub(super) map: MapBuffer,
    pub(super) target: T,
}

impl<T> Stage for HandoffReady<T> {
    const NAME: &'static str = "handoff ready";
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, super::ImageLoaded, P, F> {
    pub fn load_modules(mut self) -> Result<BootManager<'e, ModulesLoaded, P, F>, BootError> {
        self.gathered.modules =
            load_modules(&mut self.firmware, &mut self.arena, &self.entry.modules)?;
        Ok(self.advance(ModulesLoaded))
    }
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, ModulesLoaded, P, F> {
    pub fn locate_acpi(mut self) -> Result<BootManager<'e, AcpiLocated, P, F>, BootError> {
        self.gathered.rsdp = locate_rsdp(&mut self.firmware, &mut self.arena)?;
        Ok(self.advance(AcpiLocated))
    }
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, AcpiLocated, P, F> {
    pub fn describe_framebuffer(mut self) -> BootManager<'e, FramebufferDescribed, P, F> {
        self.gathered.framebuffer = self.firmware.display_mode();
        match self.gathered.framebuffer {
            Some(mode) => info!(
                "Framebuffer at {:#x}, {}x{} ({} pixels per line, {:?})",
                mode.base,
                mode.width,
                mode.height,
                mode.stride,
                mode.format
            ),
            None => info!("No usable graphics mode"),
        }
        self.advance(FramebufferDescribed)
    }
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, FramebufferDescribed, P, F> {
    /// Writes the info block and reserves room for the final memory map
    pub fn prepare_handoff(
        mut self,
    ) -> Result<BootManager<'e, HandoffReady<P::MapTarget>, P, F>, BootError> {
        if P::WANTS_TSC_FREQUENCY {
            let frequency = measure_tsc_frequency(&mut self.firmware);
            info!("Timestamp counter runs at {} Hz", frequency);
            self.gathered.tsc_frequency = Some(frequency);
        }

        let facts = BootFacts {
            command_line: &self.entry.command_line,
            modules: &self.gathered.modules,
            rsdp: self.gathered.rsdp,
            framebuffer: self.gathered.framebuffer,
            tsc_frequency: self.gathered.tsc_frequency,
        };
        let info = P::write_info(&mut self.firmware, &mut self.arena, &facts)?;
        info!("Boot info block at {:#x}", info);

        let map = self.reserve_map_buffer()?;
        let target = P::prepare_memory_map(&mut self.firmware, &mut self.arena, info, &map)?;
        Ok(self.advance(HandoffReady { info, map, target }))
    }

    /// Allocates a buffer for the final memory map with slack for changes the firmware makes later
    fn reserve_map_buffer(&mut self) -> Result<MapBuffer, BootError> {
        let mut size = self.firmware.memory_map_size();

        for _ in 0..MAP_RESERVATION_ATTEMPTS {
            let bytes = size.map_size + config::memory_map_slack() * size.descriptor_size;
            let pages = pages_for(bytes as u64);
            let address = self.arena.allocate(&mut self.firmware, Owner::BootInfo, pages)?;
            let buffer = MapBuffer {
                address,
                capacity: pages * PAGE_SIZE as usize,
                descriptor_size: size.descriptor_size,
            };

            // Allocating the buffer changed the map, so make sure it still fits while it can be
            // replaced
            let memory = unsafe { self.firmware.physical_memory(address, buffer.capacity) };
            match self.firmware.memory_map(memory) {
                Ok(snapshot) => {
                    debug!(
                        "Memory map buffer at {:#x} holds {} descriptors, {} in use",
                        address,
                        buffer.descriptor_capacity(),
                        snapshot.len / snapshot.descriptor_size
                    );
                    return Ok(buffer);
                }
                Err(MapError::BufferTooSmall { required }) => {
                    self.arena.release(&mut self.firmware, address)?;
                    size.map_size = required;
                }
                Err(MapError::Firmware(status)) => return Err(BootError::MemoryMap(status)),
            }
        }

        Err(BootError::MemoryMapTooLarge(size.map_size))
    }
}

impl<'e, T, P: Protocol, F: Firmware> BootManager<'e, HandoffReady<T>, P, F> {
    pub fn boot_info(&self) -> u64 {
        self.stage.info
    }
}

/// Counts timestamp ticks across a 1 ms stall
fn measure_tsc_frequency<F: Firmware>(firmware: &mut F) -> u64 {
    let start = firmware.timestamp();
    firmware.stall(1000);
    let end = firmware.timestamp();
    end.wrapping_sub(start) * 1000
}

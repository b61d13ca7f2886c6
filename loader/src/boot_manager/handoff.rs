use log::info;

use super::{BootManager, InterruptsDisabled, Stage};
use crate::firmware::Firmware;
use crate::memory_map::RawMemoryMap;
use crate::protocol::Protocol;

pub struct MapFinalized {
    info: u64,
}

impl Stage for MapFinalized {
    const NAME: &'static str = "memory map finalized";
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, InterruptsDisabled<P::MapTarget>, P, F> {
    /// Fetches the memory map one last time and records it for the kernel. The map may differ from
    /// the one used to exit boot services.
    pub fn finalize_memory_map(mut self) -> BootManager<'e, MapFinalized, P, F> {
        let InterruptsDisabled { info, map, target } = self.stage;

        let buffer = unsafe { self.firmware.physical_memory(map.address, map.capacity) };
        let snapshot = match self.firmware.memory_map(buffer) {
            Ok(snapshot) => snapshot,
            Err(error) => self.halt(format_args!(
                "Could not fetch the final memory map: {:?}",
                error
            )),
        };

        let raw = RawMemoryMap {
            address: map.address,
            bytes: &buffer[..snapshot.len],
            descriptor_size: snapshot.descriptor_size,
        };
        if let Err(error) = P::finish_memory_map(&mut self.firmware, target, &raw, &self.arena) {
            self.halt(format_args!(
                "Could not record the final memory map: {}",
                error
            ));
        }
        info!("Final memory map has {} firmware descriptors", raw.len());

        self.advance(MapFinalized { info })
    }
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, MapFinalized, P, F> {
    pub fn boot_info(&self) -> u64 {
        self.stage.info
    }

    /// Enters the kernel
    pub fn handoff(mut self) -> ! {
        info!(
            "Jumping to {} kernel at {:#x} with boot info at {:#x}",
            P::NAME,
            self.gathered.entry_point,
            self.stage.info
        );
        // Safety: boot services are gone, interrupts are off and the kernel is in place
        unsafe {
            self.firmware
                .jump(self.gathered.entry_point, P::MAGIC, self.stage.info)
        }
    }
}

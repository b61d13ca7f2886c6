use log::info;

use super::{BootManager, HandoffReady, Stage};
use crate::error::BootError;
use crate::firmware::{ExitError, Firmware, MapError};
use crate::protocol::{MapBuffer, Protocol};

/// Firmware may change the memory map once while we are leaving boot services. A second stale key
/// means something keeps allocating behind our back.
const MAX_EXIT_ATTEMPTS: usize = 2;

pub struct Exited<T> {
    info: u64,
    map: MapBuffer,
    target: T,
}

impl<T> Stage for Exited<T> {
    const NAME: &'static str = "exited boot services";
}

pub struct InterruptsDisabled<T> {
    pub(super) info: u64,
    pub(super) map: MapBuffer,
    pub(super) target: T,
}

impl<T> Stage for InterruptsDisabled<T> {
    const NAME: &'static str = "interrupts disabled";
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, HandoffReady<P::MapTarget>, P, F> {
    /// Leaves boot services and enters the kernel. Only returns if boot services could not be
    /// exited and are still usable.
    pub fn launch(self) -> BootError {
        match self.exit_boot_services() {
            Ok(exited) => exited.disable_interrupts().finalize_memory_map().handoff(),
            Err(error) => error,
        }
    }

    /// Fetches the memory map into the reserved buffer and exits boot services with its key.
    ///
    /// Errors are only returned if nothing has been handed to the firmware yet. Once an exit
    /// attempt has been made, boot services may be partially torn down, so any further failure
    /// halts.
    pub fn exit_boot_services(
        mut self,
    ) -> Result<BootManager<'e, Exited<P::MapTarget>, P, F>, BootError> {
        let HandoffReady { info, map, target } = self.stage;
        info!("Exiting UEFI boot services");

        // Safety: the buffer was allocated for this and nothing else refers to it
        let buffer = unsafe { self.firmware.physical_memory(map.address, map.capacity) };
        let mut attempt = 0;
        loop {
            attempt += 1;

            let snapshot = match self.firmware.memory_map(buffer) {
                Ok(snapshot) => snapshot,
                Err(MapError::BufferTooSmall { required }) if attempt == 1 => {
                    return Err(BootError::MemoryMapTooLarge(required))
                }
                Err(MapError::Firmware(status)) if attempt == 1 => {
                    return Err(BootError::MemoryMap(status))
                }
                Err(error) => self.halt(format_args!(
                    "Could not refetch the memory map: {:?}",
                    error
                )),
            };

            // Nothing may log or allocate between the fetch and the exit, or the key goes stale
            match unsafe { self.firmware.exit_boot_services(snapshot.key) } {
                Ok(()) => break,
                Err(ExitError::StaleKey) if attempt < MAX_EXIT_ATTEMPTS => continue,
                Err(error) => self.halt(format_args!(
                    "Could not exit boot services after {} attempts: {:?}",
                    attempt,
                    error
                )),
            }
        }

        self.firmware.boot_services_exited();
        info!("Exited UEFI boot services");
        Ok(self.advance(Exited { info, map, target }))
    }
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, Exited<P::MapTarget>, P, F> {
    pub fn disable_interrupts(
        mut self,
    ) -> BootManager<'e, InterruptsDisabled<P::MapTarget>, P, F> {
        self.firmware.disable_interrupts();
        let Exited { info, map, target } = self.stage;
        self.advance(InterruptsDisabled { info, map, target })
    }
}

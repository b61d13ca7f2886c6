#![cfg_attr(target_os = "uefi", no_std, no_main)]

#[cfg(target_os = "uefi")]
extern crate alloc;

#[cfg(target_os = "uefi")]
mod uefi_platform;

#[cfg(target_os = "uefi")]
mod efi {
    use log::{error, info};
    use uefi::prelude::*;
    use uefi::system;

    use tomatboot::config::{self, ProtocolKind};
    use tomatboot::protocol::{Kboot, Tboot};
    use tomatboot::{boot, logger};

    use crate::uefi_platform::{halt_loop, UefiFirmware};

    #[entry]
    fn efi_main() -> Status {
        if uefi::helpers::init().is_err() {
            return Status::ABORTED;
        }
        if logger::init().is_err() {
            return Status::ABORTED;
        }

        info!("Welcome to TomatBoot!");
        info!("Running on UEFI {}", system::uefi_revision());
        info!(
            "Firmware vendor: {} (revision {:#x})",
            system::firmware_vendor(),
            system::firmware_revision()
        );

        let mut firmware = UefiFirmware::new();
        let entries = match config::load_entries(&mut firmware) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    "Could not read boot entries from {}: {}",
                    config::entries_file(),
                    e
                );
                return Status::LOAD_ERROR;
            }
        };
        let Some(entry) = entries.first() else {
            return Status::LOAD_ERROR;
        };

        info!(
            "Booting {} ({:?}) from {}",
            entry.name, entry.protocol, entry.image_path
        );
        let error = match entry.protocol {
            ProtocolKind::Kboot => boot::<Kboot, _>(firmware, entry),
            ProtocolKind::Tboot => boot::<Tboot, _>(firmware, entry),
        };

        error!("Failed to boot {}: {}", entry.name, error);
        Status::LOAD_ERROR
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        error!("TomatBoot panicked: {}", info);
        halt_loop()
    }
}

#[cfg(not(target_os = "uefi"))]
fn main() {
    eprintln!("TomatBoot only runs as a UEFI application, build it for x86_64-unknown-uefi");
    std::process::exit(1);
}

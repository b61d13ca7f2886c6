//! Boot Manager
//!
//! The `BootManager` walks through booting a kernel using the typestate pattern, so each step can
//! only run once the ones before it are done.
//!
//! Booting consists of the following stages:
//!
//! - [`Idle`]: the manager has been created for a boot entry.
//! - [`ImageValidated`]: the kernel's ELF header, and its protocol header if the protocol needs
//!   one, have been checked. Nothing has been placed in memory yet, so a bad image costs nothing.
//! - [`ImageLoaded`]: every loadable segment sits at its physical address.
//! - [`ModulesLoaded`]: boot modules are in memory, each in its own allocation.
//! - [`AcpiLocated`]: the best ACPI root pointer has been copied, if there is one.
//! - [`FramebufferDescribed`]: the active graphics mode has been recorded, if there is one.
//! - [`HandoffReady`]: the info block is written and every buffer the final memory map needs is
//!   allocated. This is the last stage that may allocate memory, and the last one that can still
//!   fail back to the firmware.
//! - [`Exited`]: boot services are gone. From here on, failures halt the machine.
//! - [`InterruptsDisabled`]: interrupts are masked and an empty IDT is loaded, so nothing firmware
//!   left behind can run.
//! - [`MapFinalized`]: the memory map is recorded in the info block. All that remains is the jump.

use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

use log::{debug, error};

use crate::acpi::Rsdp;
use crate::config::BootEntry;
use crate::elf::PlacedSegment;
use crate::error::BootError;
use crate::firmware::{DisplayMode, Firmware};
use crate::ledger::Arena;
use crate::modules::LoadedModule;
use crate::protocol::Protocol;

mod exit_uefi;
mod gather;
mod handoff;
mod load_kernel;

pub use exit_uefi::{Exited, InterruptsDisabled};
pub use gather::{AcpiLocated, FramebufferDescribed, HandoffReady, ModulesLoaded};
pub use handoff::MapFinalized;
pub use load_kernel::{Idle, ImageLoaded, ImageValidated};

pub trait Stage {
    const NAME: &'static str;
}

/// What the earlier stages found out
#[derive(Debug, Default)]
struct Gathered {
    entry_point: u64,
    segments: Vec<PlacedSegment>,
    modules: Vec<LoadedModule>,
    rsdp: Option<Rsdp>,
    framebuffer: Option<DisplayMode>,
    tsc_frequency: Option<u64>,
}

pub struct BootManager<'e, S: Stage, P: Protocol, F: Firmware> {
    stage: S,
    firmware: F,
    arena: Arena,
    entry: &'e BootEntry,
    gathered: Gathered,
    protocol: PhantomData<P>,
}

impl<'e, S: Stage, P: Protocol, F: Firmware> BootManager<'e, S, P, F> {
    pub fn firmware_mut(&mut self) -> &mut F {
        &mut self.firmware
    }

    /// Memory allocated for the kernel so far
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn entry_point(&self) -> u64 {
        self.gathered.entry_point
    }

    fn advance<T: Stage>(self, stage: T) -> BootManager<'e, T, P, F> {
        debug!("Entering stage {}", T::NAME);
        BootManager {
            stage,
            firmware: self.firmware,
            arena: self.arena,
            entry: self.entry,
            gathered: self.gathered,
            protocol: PhantomData,
        }
    }

    /// Gives up once boot services may be gone
    fn halt(&mut self, reason: fmt::Arguments) -> ! {
        self.firmware.boot_services_exited();
        error!("{}", reason);
        self.firmware.halt()
    }
}

/// Runs every stage that can still fail back to the firmware
pub fn prepare<'e, P: Protocol, F: Firmware>(
    firmware: F,
    entry: &'e BootEntry,
) -> Result<BootManager<'e, HandoffReady<P::MapTarget>, P, F>, BootError> {
    BootManager::<Idle, P, F>::new(firmware, entry)
        .validate_image()?
        .load_image()?
        .load_modules()?
        .locate_acpi()?
        .describe_framebuffer()
        .prepare_handoff()
}

/// Boots `entry`. Only returns if something went wrong while boot services were still usable.
pub fn boot<P: Protocol, F: Firmware>(firmware: F, entry: &BootEntry) -> BootError {
    match prepare::<P, F>(firmware, entry) {
        Ok(ready) => ready.launch(),
        Err(error) => error,
    }
}

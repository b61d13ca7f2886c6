//! TomatBoot loads a kboot or tboot kernel from the boot volume, gathers what the kernel needs to
//! know about the machine, leaves UEFI boot services and jumps to the kernel.
//!
//! Everything that talks to firmware goes through the [`Firmware`](firmware::Firmware) trait, so
//! the whole pipeline up to the final jump runs on the host in tests.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acpi;
pub mod boot_manager;
pub mod config;
pub mod elf;
pub mod error;
pub mod file;
pub mod firmware;
pub mod ledger;
pub mod logger;
pub mod memory_map;
pub mod modules;
pub mod protocol;
mod util;

#[cfg(test)]
mod testing;

pub use boot_manager::{boot, prepare, BootManager};
pub use error::{BootError, ImageError};

//! Finding the ACPI root pointer in the firmware configuration table

use log::{debug, info, warn};
use uefi::{guid, Guid};

use crate::error::BootError;
use crate::firmware::Firmware;
use crate::ledger::{Arena, Owner};
use crate::util::pages_for;

pub const ACPI2_RSDP_GUID: Guid = guid!("8868e871-e4f1-11d3-bc22-0080c73c8881");
pub const ACPI1_RSDP_GUID: Guid = guid!("eb9d2d30-2d88-11d3-9a16-0090273fc14d");

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// ACPI revisions the loader knows about, best first
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcpiRevision {
    Acpi2,
    Acpi1,
}

impl AcpiRevision {
    fn from_guid(guid: &Guid) -> Option<AcpiRevision> {
        if *guid == ACPI2_RSDP_GUID {
            Some(AcpiRevision::Acpi2)
        } else if *guid == ACPI1_RSDP_GUID {
            Some(AcpiRevision::Acpi1)
        } else {
            None
        }
    }

    /// Size of the root pointer structure for this revision
    pub fn rsdp_size(self) -> usize {
        match self {
            AcpiRevision::Acpi2 => 36,
            AcpiRevision::Acpi1 => 20,
        }
    }
}

/// The loader's copy of the root pointer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rsdp {
    pub revision: AcpiRevision,
    pub address: u64,
}

/// Copies the best root pointer the firmware publishes into boot info memory.
///
/// An ACPI 2.0 pointer always wins over a 1.0 one, whatever order the firmware lists them in.
/// Entries that do not look like a root pointer are ignored.
pub fn locate_rsdp<F: Firmware>(
    firmware: &mut F,
    arena: &mut Arena,
) -> Result<Option<Rsdp>, BootError> {
    let mut best: Option<Rsdp> = None;

    for table in firmware.config_tables() {
        let Some(revision) = AcpiRevision::from_guid(&table.guid) else {
            continue;
        };
        if best.is_some_and(|held| held.revision <= revision) {
            continue;
        }
        if table.address == 0 {
            warn!("Ignoring {:?} root pointer at address 0", revision);
            continue;
        }

        let size = revision.rsdp_size();
        let mut rsdp = [0u8; 36];
        // Safety: the firmware published this table
        let published = unsafe { firmware.physical_memory(table.address, size) };
        rsdp[..size].copy_from_slice(published);
        if &rsdp[..8] != RSDP_SIGNATURE {
            warn!(
                "Ignoring {:?} root pointer at {:#x} with a bad signature",
                revision, table.address
            );
            continue;
        }

        if let Some(previous) = best.take() {
            debug!(
                "Replacing {:?} root pointer with {:?}",
                previous.revision, revision
            );
            arena.release(firmware, previous.address)?;
        }

        let address = arena.allocate(firmware, Owner::BootInfo, pages_for(size as u64))?;
        unsafe { firmware.physical_memory(address, size) }.copy_from_slice(&rsdp[..size]);
        best = Some(Rsdp { revision, address });
    }

    match best {
        Some(rsdp) => info!(
            "Found {:?} root pointer, copied to {:#x}",
            rsdp.revision, rsdp.address
        ),
        None => warn!("Firmware does not publish an ACPI root pointer"),
    }
    Ok(best)
}

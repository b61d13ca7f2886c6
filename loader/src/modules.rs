//! Loading boot modules, files the kernel receives in memory alongside its own image

use alloc::string::String;
use alloc::vec::Vec;

use log::info;
use tomatboot_boot_info::MemoryType;

use crate::config::BootModule;
use crate::error::BootError;
use crate::file::File;
use crate::firmware::Firmware;
use crate::ledger::{Arena, Owner};
use crate::util::pages_for;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub tag: String,
    pub base: u64,
    pub length: u64,
}

/// Reads every module fully into its own page-aligned allocation, in order
pub fn load_modules<F: Firmware>(
    firmware: &mut F,
    arena: &mut Arena,
    modules: &[BootModule],
) -> Result<Vec<LoadedModule>, BootError> {
    if modules.len() > MemoryType::MAX_MODULES {
        return Err(BootError::TooManyModules(modules.len()));
    }

    modules
        .iter()
        .enumerate()
        .map(|(index, module)| load_module(firmware, arena, index as u32, module))
        .collect()
}

fn load_module<F: Firmware>(
    firmware: &mut F,
    arena: &mut Arena,
    index: u32,
    module: &BootModule,
) -> Result<LoadedModule, BootError> {
    let mut file = File::open(firmware, &module.path)?;
    let length = file.size()?;

    // Empty modules still get a page so every module has a distinct address
    let base = arena.allocate(firmware, Owner::Module(index), pages_for(length).max(1))?;
    let contents = unsafe { firmware.physical_memory(base, length as usize) };
    file.read_exact_at(0, contents)?;

    info!(
        "Loaded module `{}` from {} to {:#x} ({} bytes)",
        module.tag, module.path, base, length
    );
    Ok(LoadedModule {
        tag: module.tag.clone(),
        base,
        length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimFirmware;

    fn module(tag: &str, path: &str) -> BootModule {
        BootModule {
            tag: tag.into(),
            path: path.into(),
        }
    }

    #[test]
    fn modules_load_in_order_with_distinct_owners() {
        let mut firmware = SimFirmware::new();
        let mut arena = Arena::new();
        firmware.add_file("initrd", vec![7; 5000]);
        firmware.add_file("empty", Vec::new());
        firmware.add_file("font", vec![3; 16]);

        let loaded = load_modules(
            &mut firmware,
            &mut arena,
            &[
                module("initrd", "initrd"),
                module("nothing", "empty"),
                module("font", "font"),
            ],
        )
        .unwrap();

        let tags: Vec<&str> = loaded.iter().map(|m| m.tag.as_str()).collect();
        assert_eq!(tags, ["initrd", "nothing", "font"]);
        assert_eq!(loaded[0].length, 5000);
        assert_eq!(loaded[1].length, 0);
        assert_eq!(firmware.bytes(loaded[0].base, 5000), vec![7; 5000]);
        assert_eq!(firmware.bytes(loaded[2].base, 16), vec![3; 16]);

        for (index, module) in loaded.iter().enumerate() {
            assert_eq!(module.base % 4096, 0);
            let allocation = arena
                .allocations()
                .iter()
                .find(|a| a.base == module.base)
                .unwrap();
            assert_eq!(allocation.owner, Owner::Module(index as u32));
            assert!(allocation.pages >= 1);
        }
    }

    #[test]
    fn missing_module_fails() {
        let mut firmware = SimFirmware::new();
        let mut arena = Arena::new();
        let err =
            load_modules(&mut firmware, &mut arena, &[module("initrd", "missing")]).unwrap_err();
        assert!(matches!(err, BootError::Open { ref path, .. } if path == "missing"));
    }
}

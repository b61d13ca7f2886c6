use core::marker::PhantomData;

use log::info;

use super::{BootManager, Gathered, Stage};
use crate::config::BootEntry;
use crate::elf::KernelImage;
use crate::error::{BootError, ImageError};
use crate::file::File;
use crate::firmware::{FileHandle, Firmware};
use crate::ledger::Arena;
use crate::protocol::Protocol;

pub struct Idle;

impl Stage for Idle {
    const NAME: &'static str = "idle";
}

pub struct ImageValidated<H: FileHandle> {
    image: KernelImage<H>,
}

impl<H: FileHandle> Stage for ImageValidated<H> {
    const NAME: &'static str = "image validated";
}

pub struct ImageLoaded;

impl Stage for ImageLoaded {
    const NAME: &'static str = "image loaded";
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, Idle, P, F> {
    pub fn new(firmware: F, entry: &'e BootEntry) -> BootManager<'e, Idle, P, F> {
        BootManager {
            stage: Idle,
            firmware,
            arena: Arena::new(),
            entry,
            gathered: Gathered::default(),
            protocol: PhantomData,
        }
    }

    /// Checks the kernel image and the entry against the protocol before anything is placed in
    /// memory
    pub fn validate_image(
        mut self,
    ) -> Result<BootManager<'e, ImageValidated<F::File>, P, F>, BootError> {
        info!("Loading {} kernel from {}", P::NAME, self.entry.image_path);

        if !P::SUPPORTS_MODULES && !self.entry.modules.is_empty() {
            return Err(BootError::ModulesUnsupported { protocol: P::NAME });
        }

        let file = File::open(&mut self.firmware, &self.entry.image_path)?;
        let mut image = KernelImage::open(file)?;

        if let Some(name) = P::HEADER_SECTION {
            let section = image.find_section(name)?;
            if section.sh_size < P::HEADER_SIZE as u64 {
                return Err(ImageError::SectionTooSmall {
                    name,
                    size: section.sh_size,
                    expected: P::HEADER_SIZE,
                }
                .into());
            }
            let header = image.read_section(&section, P::HEADER_SIZE)?;
            P::check_header(&header)?;
        }

        Ok(self.advance(ImageValidated { image }))
    }
}

impl<'e, P: Protocol, F: Firmware> BootManager<'e, ImageValidated<F::File>, P, F> {
    /// Places the kernel's segments. The image file is closed afterwards.
    pub fn load_image(mut self) -> Result<BootManager<'e, ImageLoaded, P, F>, BootError> {
        let segments = self
            .stage
            .image
            .load_segments(&mut self.firmware, &mut self.arena)?;
        self.gathered.entry_point = self.stage.image.entry_point();
        self.gathered.segments = segments;

        info!(
            "Loaded {} segments, kernel entry point is {:#x}",
            self.gathered.segments.len(),
            self.gathered.entry_point
        );
        Ok(self.advance(ImageLoaded))
    }
}

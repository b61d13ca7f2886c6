use alloc::string::{String, ToString};
use core::mem;

use plain::Plain;

use crate::error::BootError;
use crate::firmware::{FileHandle, Firmware};

/// Longest path accepted, in bytes
pub const MAX_PATH_LEN: usize = 255;

/// Random-access reader over a file on the boot volume
pub struct File<H: FileHandle> {
    inner: H,
    path: String,
}

impl<H: FileHandle> File<H> {
    pub fn open<F: Firmware<File = H>>(firmware: &mut F, path: &str) -> Result<File<H>, BootError> {
        if path.len() > MAX_PATH_LEN {
            return Err(BootError::PathTooLong(path.to_string()));
        }

        let inner = firmware.open(path).map_err(|status| BootError::Open {
            path: path.to_string(),
            status,
        })?;
        Ok(File {
            inner,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&mut self) -> Result<u64, BootError> {
        self.inner.size().map_err(|status| self.io_error(status))
    }

    /// Reads up to `buf.len()` bytes at `offset`, stopping early only at the end of the file
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, BootError> {
        self.inner
            .set_position(offset)
            .map_err(|status| self.io_error(status))?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(status) => return Err(self.io_error(status)),
            }
        }
        Ok(filled)
    }

    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BootError> {
        let actual = self.read_at(offset, buf)?;
        if actual < buf.len() {
            return Err(BootError::ShortRead {
                path: self.path.clone(),
                offset,
                expected: buf.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Reads a `T` stored at `offset`. `SIZE` must be the size of `T`.
    pub fn read_as<T: Plain + Default, const SIZE: usize>(
        &mut self,
        offset: u64,
    ) -> Result<T, BootError> {
        debug_assert_eq!(SIZE, mem::size_of::<T>());
        let mut buf = [0u8; SIZE];
        self.read_exact_at(offset, &mut buf)?;

        let mut result = T::default();
        // Can only fail if the buffer is too small, which read_exact_at rules out
        let _ = result.copy_from_bytes(&buf);
        Ok(result)
    }

    fn io_error(&self, status: uefi::Status) -> BootError {
        BootError::Io {
            path: self.path.clone(),
            status,
        }
    }
}

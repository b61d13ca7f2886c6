use core::mem;
use core::slice;

use plain::Plain;
use x86_64::{align_down, align_up};

use crate::firmware::Firmware;

pub const PAGE_SIZE: u64 = 4096;

/// Number of pages needed to hold `bytes` bytes
pub fn pages_for(bytes: u64) -> usize {
    (align_up(bytes, PAGE_SIZE) / PAGE_SIZE) as usize
}

pub fn page_base(address: u64) -> u64 {
    align_down(address, PAGE_SIZE)
}

/// Views physical memory as a slice of `T`.
///
/// # Safety
/// `address` must be the start of memory the loader owns, aligned for `T` and large enough for
/// `count` values. No other live reference may overlap it.
pub unsafe fn physical_slice<F: Firmware, T: Plain>(
    firmware: &mut F,
    address: u64,
    count: usize,
) -> &'static mut [T] {
    let bytes = firmware.physical_memory(address, count * mem::size_of::<T>());
    slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), count)
}

/// Copies `value` into physical memory at `address`.
///
/// # Safety
/// Same requirements as [`physical_slice`] for a single `T`.
pub unsafe fn write_physical<F: Firmware, T: Plain + Copy + 'static>(
    firmware: &mut F,
    address: u64,
    value: T,
) {
    physical_slice::<F, T>(firmware, address, 1)[0] = value;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_round_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
        assert_eq!(page_base(0x20_1234), 0x20_1000);
    }
}

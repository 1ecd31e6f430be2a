use embedded_storage::nor_flash::NorFlash;

/// Anything that can be erased, written and read like NOR flash and that can tell whether the
/// supply voltage is high enough to do so safely. See README.md for an example implementation.
pub trait Platform: SupplyMonitor + NorFlash {}

impl<T: SupplyMonitor + NorFlash> Platform for T {}

/// Consulted before every erase or write. Returning `false` aborts the mutation with
/// [`Error::LowVoltage`](crate::error::Error::LowVoltage).
pub trait SupplyMonitor {
    fn supply_ok(&mut self) -> bool;
}

impl<T: SupplyMonitor> SupplyMonitor for &mut T {
    fn supply_ok(&mut self) -> bool {
        T::supply_ok(self)
    }
}

pub trait AlignedOps: Platform {
    fn align_read_ceil(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_read_floor(size: usize) -> usize {
        align_floor(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use esp_storage::FlashStorage;

    use crate::platform::SupplyMonitor;

    // The brown-out detector resets the chip before flash operations can misbehave.
    impl SupplyMonitor for FlashStorage<'_> {
        fn supply_ok(&mut self) -> bool {
            true
        }
    }
}

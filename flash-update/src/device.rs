// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! SPI NOR device abstraction consumed by the engine.

use {
    crate::FlashError,
    consts::{FLASH_LOADER_PAGE_BUF_SIZE, MAX_SUBSECTOR_SIZE},
};

/// Raw SPI NOR command set.
///
/// Erase and program only start the operation; the engine polls
/// [`status`](SpiNorFlash::status) until the device is ready again.
pub trait SpiNorFlash {
    /// Read the device identification and timing table.
    fn geometry(&mut self) -> Result<FlashGeometry, DeviceFault>;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), DeviceFault>;

    /// Start erasing the subsector that begins at `address`.
    fn start_subsector_erase(&mut self, address: u32) -> Result<(), DeviceFault>;

    /// Start programming `data` at `address`. The range never crosses a page
    /// boundary.
    fn start_page_program(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceFault>;

    /// Read the flag status register.
    fn status(&mut self) -> Result<DeviceStatus, DeviceFault>;
}

/// Monotonic hardware counter.
pub trait Clock {
    fn now_us(&self) -> u64;
}

/// State reported by the flag status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceStatus {
    Busy,
    Ready,
    /// The last erase or program did not complete.
    Failed,
    /// The controller flagged an uncorrectable ECC error.
    Uecc,
}

/// Transfer level failure of a device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceFault {
    /// SPI transfer failed or the command was rejected.
    Bus,
    /// Uncorrectable ECC error while reading.
    Uecc,
}

/// Device layout and worst case operation times, queried once per boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashGeometry {
    pub page_size: u32,
    pub pages_per_subsector: u32,
    pub subsectors_per_sector: u32,
    pub sectors: u32,
    pub max_page_program_us: u32,
    pub max_subsector_erase_us: u32,
}

impl FlashGeometry {
    pub fn subsector_size(&self) -> u32 {
        self.page_size * self.pages_per_subsector
    }

    pub fn sector_size(&self) -> u32 {
        self.subsector_size() * self.subsectors_per_sector
    }

    pub fn capacity(&self) -> u32 {
        self.sector_size() * self.sectors
    }

    /// Check the device can be driven through the engine's subsector buffer
    /// and that a subsector holds at least one host page.
    pub(crate) fn validate(&self) -> Result<(), FlashError> {
        let sizes_valid = self.page_size.is_power_of_two()
            && self.pages_per_subsector.is_power_of_two()
            && self.subsectors_per_sector != 0
            && self.sectors != 0;
        if !sizes_valid {
            return Err(FlashError::Geometry);
        }
        let subsector = self
            .page_size
            .checked_mul(self.pages_per_subsector)
            .ok_or(FlashError::Geometry)?;
        // Staging erases whole subsectors under each host page.
        if !(FLASH_LOADER_PAGE_BUF_SIZE..=MAX_SUBSECTOR_SIZE).contains(&(subsector as usize)) {
            return Err(FlashError::Geometry);
        }
        subsector
            .checked_mul(self.subsectors_per_sector)
            .and_then(|s| s.checked_mul(self.sectors))
            .ok_or(FlashError::Geometry)?;
        Ok(())
    }
}

// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::{ImageHeader, ImageSource};

/// Build identification stored in the last bytes of every image body.
///
/// Lets the boot code compare two copies of the firmware without running a
/// full authentication pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VersionRecord {
    pub major: u32,
    pub minor: u32,
    pub build_patch: u32,
    pub build_number: u32,
    /// `mmddyyyy`
    pub build_date: u32,
}

impl VersionRecord {
    pub const SIZE: usize = 20;

    /// What an erased or unreadable record reads as.
    pub const ERASED: Self = Self {
        major: u32::MAX,
        minor: u32::MAX,
        build_patch: u32::MAX,
        build_number: u32::MAX,
        build_date: u32::MAX,
    };

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Self {
            major: word(0),
            minor: word(1),
            build_patch: word(2),
            build_number: word(3),
            build_date: word(4),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        let words = [
            self.major,
            self.minor,
            self.build_patch,
            self.build_number,
            self.build_date,
        ];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Read the record of the image whose header is at `header_address`.
    ///
    /// `fw_length` is the declared body length and `body_capacity` the size of
    /// the partition body. Lengths that cannot hold a record, or that overrun
    /// the partition, read as [`Self::ERASED`].
    pub fn read(
        source: &mut impl ImageSource,
        header_address: u32,
        fw_length: u32,
        body_capacity: u32,
    ) -> Self {
        if fw_length < Self::SIZE as u32 || fw_length > body_capacity {
            return Self::ERASED;
        }
        let address = header_address + ImageHeader::SIZE as u32 + fw_length - Self::SIZE as u32;
        if !source.is_image_memory(address, Self::SIZE as u32) {
            return Self::ERASED;
        }
        let mut bytes = [0xFF; Self::SIZE];
        match source.read_image(address, &mut bytes) {
            Ok(()) => Self::from_bytes(&bytes),
            Err(_) => Self::ERASED,
        }
    }
}

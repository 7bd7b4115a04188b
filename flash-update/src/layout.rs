// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    crate::{
        device::{Clock, FlashGeometry, SpiNorFlash},
        Engine, FlashError,
    },
    consts::*,
    embedded_storage::Storage,
    host_protocol::PartitionId,
};

/// A byte range of the flash array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub start: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    pub const fn end(&self) -> u32 {
        self.start + self.size
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Header plus body of one firmware copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImagePartition {
    pub header: u32,
    /// Largest body the partition can hold.
    pub body_capacity: u32,
}

impl ImagePartition {
    pub const fn body(&self) -> u32 {
        self.header + IMG_HDR_SIZE
    }

    /// Header and body size together.
    pub const fn capacity(&self) -> u32 {
        IMG_HDR_SIZE + self.body_capacity
    }

    pub const fn region(&self) -> Region {
        Region::new(self.header, self.capacity())
    }
}

/// Where the update code finds everything it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionLayout {
    pub active_flag: Region,
    /// Indexed by [`PartitionId::index`].
    pub images: [ImagePartition; 2],
    pub staging: Region,
    /// First byte past everything the layout claims, other owners included.
    pub end: u32,
}

impl PartitionLayout {
    /// Production layout.
    pub const DEFAULT: Self = Self {
        active_flag: Region::new(ACTIVE_IMG_FLAG_ADDR, ACTIVE_IMG_FLAG_SIZE),
        images: [
            ImagePartition {
                header: IMG_A_HDR_ADDR,
                body_capacity: IMG_A_SIZE,
            },
            ImagePartition {
                header: IMG_B_HDR_ADDR,
                body_capacity: IMG_B_SIZE,
            },
        ],
        staging: Region::new(UPGRADE_ADDR, UPGRADE_SIZE),
        end: LAYOUT_END,
    };

    pub fn image(&self, id: PartitionId) -> &ImagePartition {
        &self.images[id.index()]
    }

    /// Largest body the staging region can hold.
    pub fn staging_body_capacity(&self) -> u32 {
        self.staging.size.saturating_sub(IMG_HDR_SIZE)
    }

    /// Check the layout against the detected device.
    ///
    /// Image partitions may start mid-subsector, the engine preserves their
    /// neighbours. The staging region must be subsector aligned because it is
    /// erased one subsector at a time while the host writes to it.
    pub fn validate(&self, geometry: &FlashGeometry) -> Result<(), LayoutError> {
        let ss = geometry.subsector_size();
        if self.end > geometry.capacity() {
            return Err(LayoutError::ExceedsCapacity {
                end: self.end,
                capacity: geometry.capacity(),
            });
        }
        if self.staging.start % ss != 0 || self.staging.size % ss != 0 {
            return Err(LayoutError::Misaligned(self.staging.start));
        }
        if self.active_flag.size < 4 {
            return Err(LayoutError::Misaligned(self.active_flag.start));
        }

        let regions = [
            self.active_flag,
            self.images[0].region(),
            self.images[1].region(),
            self.staging,
        ];
        for (i, a) in regions.iter().enumerate() {
            if a.end() > self.end {
                return Err(LayoutError::ExceedsCapacity {
                    end: a.end(),
                    capacity: self.end,
                });
            }
            if let Some(b) = regions[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(LayoutError::Overlap(a.start, b.start));
            }
        }
        if self.staging.size <= IMG_HDR_SIZE {
            return Err(LayoutError::StagingTooSmall);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    ExceedsCapacity { end: u32, capacity: u32 },
    Misaligned(u32),
    Overlap(u32, u32),
    StagingTooSmall,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ExceedsCapacity { end, capacity } => {
                write!(f, "layout ends at {end:#x}, past {capacity:#x}")
            }
            Self::Misaligned(at) => write!(f, "region at {at:#x} is not subsector aligned"),
            Self::Overlap(a, b) => write!(f, "regions at {a:#x} and {b:#x} overlap"),
            Self::StagingTooSmall => write!(f, "staging region cannot hold an image"),
        }
    }
}

/// The flash cell deciding which partition boots first.
pub struct ActiveImageFlag;

impl ActiveImageFlag {
    pub fn read<D: SpiNorFlash, C: Clock>(
        engine: &mut Engine<D, C>,
        layout: &PartitionLayout,
    ) -> Result<PartitionId, FlashError> {
        let mut cell = [0u8; 1];
        engine.read(layout.active_flag.start, &mut cell)?;
        Ok(if cell[0] & ACTIVE_IMG_MASK == ACTIVE_IMG_A {
            PartitionId::A
        } else {
            PartitionId::B
        })
    }

    /// Select `id`. Only the flag byte changes, the rest of its subsector is
    /// rewritten as it was.
    pub fn write<D: SpiNorFlash, C: Clock>(
        engine: &mut Engine<D, C>,
        layout: &PartitionLayout,
        id: PartitionId,
    ) -> Result<(), FlashError> {
        let value = match id {
            PartitionId::A => ACTIVE_IMG_A,
            PartitionId::B => ACTIVE_IMG_B,
        };
        Storage::write(engine, layout.active_flag.start, &[value])
    }
}

// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host driven staged write and commit.
//!
//! The host streams pages into the staging region with consecutive sequence
//! numbers, then asks for a commit. A commit authenticates the staged image,
//! copies it into the named partition and only then flips the active image
//! flag. Every failure drops back to idle with a specific error code.

use {
    crate::{
        device::{Clock, SpiNorFlash},
        layout::{ActiveImageFlag, PartitionLayout},
        Engine, FlashError,
    },
    consts::{FLASH_LOADER_PAGE_BUF_SIZE, REQ_RESP_BUF_LENGTH},
    crc::{Crc, CRC_32_ISCSI},
    fw_image::{Authenticator, ImageHasher, ImageHeader, ImageId, KeyValidity, SignatureVerify},
    host_protocol::{ErrorCode, PartitionId, WriteAck},
};

const PAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Where the flashloader is in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashloaderState {
    Idle,
    Writing {
        partition: PartitionId,
        next_sequence: u32,
        /// Bytes of staging covered by the pages received so far.
        staged: u32,
    },
}

/// RAM copy of the page being programmed into staging.
struct StagingBuffer {
    page: [u8; FLASH_LOADER_PAGE_BUF_SIZE],
}

impl StagingBuffer {
    /// Load `data`, padding the rest of the page with erased bytes.
    fn load(&mut self, data: &[u8]) -> &[u8] {
        self.page.fill(0xFF);
        self.page[..data.len()].copy_from_slice(data);
        &self.page
    }
}

pub struct Flashloader {
    state: FlashloaderState,
    staging: StagingBuffer,
}

impl Default for Flashloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Flashloader {
    pub fn new() -> Self {
        Self {
            state: FlashloaderState::Idle,
            staging: StagingBuffer {
                page: [0xFF; FLASH_LOADER_PAGE_BUF_SIZE],
            },
        }
    }

    pub fn state(&self) -> FlashloaderState {
        self.state
    }

    pub fn is_writing(&self) -> bool {
        matches!(self.state, FlashloaderState::Writing { .. })
    }

    /// Store one page of the image in staging.
    ///
    /// Sequence 0 starts a new transaction, aborting any current one. Any
    /// other sequence must follow the previous page, and only the last page
    /// of a transaction may be shorter than a full page. Rejected pages leave
    /// the flash and the transaction untouched.
    pub fn write<D: SpiNorFlash, C: Clock>(
        &mut self,
        engine: &mut Engine<D, C>,
        layout: &PartitionLayout,
        partition: PartitionId,
        sequence: u32,
        page: &[u8],
    ) -> Result<WriteAck, ErrorCode> {
        let page_size = FLASH_LOADER_PAGE_BUF_SIZE as u32;
        if page.is_empty() || page.len() > FLASH_LOADER_PAGE_BUF_SIZE {
            return Err(ErrorCode::InvalidPageLength);
        }
        match self.state {
            _ if sequence == 0 => {}
            FlashloaderState::Writing {
                partition: current,
                next_sequence,
                staged,
            } if sequence == next_sequence => {
                if current != partition {
                    return Err(ErrorCode::InvalidPartitionId);
                }
                // Only the last page may be short.
                if staged % page_size != 0 {
                    log_warn!("write {} after a short page", sequence);
                    return Err(ErrorCode::InvalidPageLength);
                }
            }
            FlashloaderState::Writing { next_sequence, .. } => {
                log_warn!("write {} out of order, expected {}", sequence, next_sequence);
                return Err(ErrorCode::SequenceError);
            }
            FlashloaderState::Idle => {
                log_warn!("write {} without a transaction", sequence);
                return Err(ErrorCode::SequenceError);
            }
        }

        let offset = sequence
            .checked_mul(page_size)
            .filter(|&offset| offset + page_size <= layout.staging.size)
            .ok_or(ErrorCode::AddressOutOfRange)?;
        let address = layout.staging.start + offset;

        if sequence == 0 {
            log_info!("staging write started for partition {:?}", partition);
        }
        if let Err(e) = self.stage(engine, layout, address, page) {
            self.state = FlashloaderState::Idle;
            return Err(e);
        }

        self.state = FlashloaderState::Writing {
            partition,
            next_sequence: sequence + 1,
            staged: offset + page.len() as u32,
        };
        Ok(WriteAck {
            sequence,
            crc: PAGE_CRC.checksum(page),
        })
    }

    fn stage<D: SpiNorFlash, C: Clock>(
        &mut self,
        engine: &mut Engine<D, C>,
        layout: &PartitionLayout,
        address: u32,
        page: &[u8],
    ) -> Result<(), ErrorCode> {
        // Staging is erased a subsector ahead of the write cursor, never at
        // abort time.
        let ss = engine.geometry().subsector_size();
        if address % ss == 0 {
            let len = ss.min(layout.staging.end() - address);
            engine.erase(address, len).map_err(flash_error_code)?;
        }
        let data = self.staging.load(page);
        engine.program(address, data).map_err(flash_error_code)
    }

    /// Drop the current transaction. Target partitions are not touched.
    pub fn abort(&mut self) {
        if let FlashloaderState::Writing { next_sequence, .. } = self.state {
            log_info!("write aborted after {} pages", next_sequence);
        }
        self.state = FlashloaderState::Idle;
    }

    /// Authenticate the staged image and install it into `partition`.
    ///
    /// The active image flag is rewritten last, after the copy reads back
    /// identical to staging.
    pub fn commit<D, C, H, V, K>(
        &mut self,
        engine: &mut Engine<D, C>,
        authenticator: &mut Authenticator<'_, H, V, K>,
        layout: &PartitionLayout,
        partition: PartitionId,
    ) -> Result<(), ErrorCode>
    where
        D: SpiNorFlash,
        C: Clock,
        H: ImageHasher,
        V: SignatureVerify,
        K: KeyValidity,
    {
        let FlashloaderState::Writing {
            partition: staged_for,
            staged,
            ..
        } = core::mem::replace(&mut self.state, FlashloaderState::Idle)
        else {
            return Err(ErrorCode::NoTransaction);
        };
        if staged_for != partition {
            return Err(ErrorCode::InvalidPartitionId);
        }

        // Validate.
        let staged_image = authenticator.authenticate_image(
            &mut *engine,
            layout.staging.start,
            ImageId::Upgrade,
            layout.staging_body_capacity(),
        );
        if !staged_image.status.is_success() {
            log_error!("staged image rejected: {:?}", staged_image.status);
            return Err(ErrorCode::AuthenticationError);
        }
        let mut raw = [0u8; ImageHeader::SIZE];
        engine
            .read(layout.staging.start, &mut raw)
            .map_err(flash_error_code)?;
        let header = ImageHeader::parse_unverified(&raw).map_err(|_| ErrorCode::AuthenticationError)?;
        let image_length = header.image_length();
        let target = *layout.image(partition);
        if image_length > target.capacity() || image_length > staged {
            log_error!(
                "image of {} bytes does not fit partition {:?} or was not fully staged",
                image_length,
                partition
            );
            return Err(ErrorCode::CommitLengthOutOfRange);
        }

        // Finalize.
        log_info!("installing {} bytes into partition {:?}", image_length, partition);
        engine
            .erase(target.header, image_length)
            .map_err(flash_error_code)?;
        engine
            .copy(layout.staging.start, target.header, image_length)
            .map_err(flash_error_code)?;
        match engine.compare(layout.staging.start, target.header, image_length) {
            Ok(None) => {}
            Ok(Some(address)) => {
                log_error!("installed image differs from staging at {:#x}", address);
                return Err(ErrorCode::CompareMismatch);
            }
            Err(e) => return Err(flash_error_code(e)),
        }
        ActiveImageFlag::write(engine, layout, partition).map_err(|e| {
            if e.is_timeout() {
                ErrorCode::PartitionValueWriteTimeout
            } else {
                ErrorCode::PartitionValueWrite
            }
        })?;
        log_info!("partition {:?} is now active", partition);
        Ok(())
    }
}

/// Read up to one response worth of a partition, counted from its header.
pub fn flash_read<D: SpiNorFlash, C: Clock>(
    engine: &mut Engine<D, C>,
    layout: &PartitionLayout,
    partition: PartitionId,
    offset: u32,
    length: u32,
    buf: &mut [u8; REQ_RESP_BUF_LENGTH],
) -> Result<usize, ErrorCode> {
    if length as usize > REQ_RESP_BUF_LENGTH {
        return Err(ErrorCode::InvalidReadLength);
    }
    let image = layout.image(partition);
    offset
        .checked_add(length)
        .filter(|&end| end <= image.capacity())
        .ok_or(ErrorCode::AddressOutOfRange)?;
    let len = length as usize;
    engine
        .read(image.header + offset, &mut buf[..len])
        .map_err(flash_error_code)?;
    Ok(len)
}

/// Erase a whole partition, header included.
pub fn partition_erase<D: SpiNorFlash, C: Clock>(
    engine: &mut Engine<D, C>,
    layout: &PartitionLayout,
    partition: PartitionId,
) -> Result<(), ErrorCode> {
    let image = layout.image(partition);
    log_info!("erasing partition {:?}", partition);
    engine
        .erase(image.header, image.capacity())
        .map_err(flash_error_code)
}

pub(crate) fn flash_error_code(e: FlashError) -> ErrorCode {
    match e {
        FlashError::Geometry => ErrorCode::DevInfoGet,
        FlashError::OutOfBounds { .. } | FlashError::Overlap => ErrorCode::AddressOutOfRange,
        FlashError::Read { .. } => ErrorCode::FlashRead,
        FlashError::Erase { .. } => ErrorCode::SubsectorErase,
        FlashError::EraseTimeout { .. } => ErrorCode::SubsectorEraseTimeout,
        FlashError::Program { .. } => ErrorCode::FlashWriteFail,
        FlashError::ProgramTimeout { .. } => ErrorCode::FlashWriteTimeout,
        FlashError::Uecc { .. } => ErrorCode::Uecc,
    }
}

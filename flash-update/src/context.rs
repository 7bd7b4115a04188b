// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    crate::{
        device::{Clock, SpiNorFlash},
        flashloader::{self, flash_error_code, Flashloader},
        layout::{ActiveImageFlag, LayoutError, PartitionLayout},
        sync::{self, read_fw_length, AuthInfo, BootHandoff, SyncOutcome},
        Engine, FlashError,
    },
    consts::{FW_VERSION_STR_LEN, PARTITION_NUMBER, REQ_RESP_BUF_LENGTH},
    fw_image::{Authenticator, ImageHasher, KeyValidity, SignatureVerify, VersionRecord},
    host_protocol::{
        Command, ErrorCode, FwVersion, PartitionEntry, PartitionId, PartitionInfo, Request,
        Response, VersionInfo,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    Flash(FlashError),
    Layout(LayoutError),
    /// The firmware version string does not fit the version buffer.
    VersionTooLong,
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Flash(e) => write!(f, "flash: {e}"),
            Self::Layout(e) => write!(f, "partition layout: {e}"),
            Self::VersionTooLong => write!(f, "version string longer than {FW_VERSION_STR_LEN} bytes"),
        }
    }
}

impl From<FlashError> for InitError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl From<LayoutError> for InitError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

fn fw_version(record: VersionRecord) -> FwVersion {
    FwVersion {
        major: record.major,
        minor: record.minor,
        build_patch: record.build_patch,
        build_number: record.build_number,
        build_date: record.build_date,
    }
}

/// Everything the update code owns for one boot.
///
/// Built once by [`init`](Self::init), which also runs the redundancy check,
/// so host commands are only ever handled after it finished.
pub struct FlashUpdateContext<'k, D, C, H, V, K> {
    engine: Engine<D, C>,
    authenticator: Authenticator<'k, H, V, K>,
    layout: PartitionLayout,
    flashloader: Flashloader,
    auth_info: AuthInfo,
    last_sync: SyncOutcome,
    version: heapless::String<FW_VERSION_STR_LEN>,
}

impl<'k, D, C, H, V, K> FlashUpdateContext<'k, D, C, H, V, K>
where
    D: SpiNorFlash,
    C: Clock,
    H: ImageHasher,
    V: SignatureVerify,
    K: KeyValidity,
{
    /// Query the flash, check `layout` against it and bring the redundant
    /// image in line with the one that booted.
    pub fn init(
        device: D,
        clock: C,
        authenticator: Authenticator<'k, H, V, K>,
        layout: PartitionLayout,
        version: &str,
        handoff: &BootHandoff,
    ) -> Result<Self, InitError> {
        let engine = Engine::new(device, clock)?;
        layout.validate(engine.geometry())?;
        let version = heapless::String::try_from(version).map_err(|_| InitError::VersionTooLong)?;

        let mut context = Self {
            engine,
            authenticator,
            layout,
            flashloader: Flashloader::new(),
            auth_info: AuthInfo::new(handoff.images[0].partition),
            last_sync: SyncOutcome::Skipped,
            version,
        };
        context.synchronize(handoff);
        Ok(context)
    }

    /// Run one redundancy pass and replace the diagnostics with its result.
    pub fn synchronize(&mut self, handoff: &BootHandoff) -> SyncOutcome {
        let (info, outcome) =
            sync::synchronize(&mut self.engine, &mut self.authenticator, &self.layout, handoff);
        self.auth_info = info;
        self.last_sync = outcome;
        outcome
    }

    pub fn auth_info(&self) -> &AuthInfo {
        &self.auth_info
    }

    pub fn last_sync(&self) -> SyncOutcome {
        self.last_sync
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    pub fn flashloader(&self) -> &Flashloader {
        &self.flashloader
    }

    pub fn engine_mut(&mut self) -> &mut Engine<D, C> {
        &mut self.engine
    }

    /// Decode one request and process it. Malformed requests are answered
    /// with a failure response like any other error.
    pub fn handle(&mut self, request: &[u8]) -> Response {
        match Request::decode(request) {
            Ok(request) => self.handle_command(request.command),
            Err(code) => {
                log_warn!("rejecting request: {:?}", code);
                Response::failure(code)
            }
        }
    }

    pub fn handle_command(&mut self, command: Command<'_>) -> Response {
        let result = match command {
            Command::Null => Err(ErrorCode::UnknownCommand),
            Command::Write {
                partition,
                sequence,
                page,
            } => self
                .flashloader
                .write(&mut self.engine, &self.layout, partition, sequence, page)
                .and_then(|ack| Response::with_payload(&ack)),
            Command::Commit { partition } => self
                .flashloader
                .commit(&mut self.engine, &mut self.authenticator, &self.layout, partition)
                .map(|()| Response::success()),
            Command::WriteAbort => {
                self.flashloader.abort();
                Ok(Response::success())
            }
            Command::PartitionInfoGet => self
                .partition_info()
                .and_then(|info| Response::with_payload(&info)),
            Command::FlashRead {
                partition,
                offset,
                length,
            } => {
                let mut buf = [0u8; REQ_RESP_BUF_LENGTH];
                flashloader::flash_read(&mut self.engine, &self.layout, partition, offset, length, &mut buf)
                    .and_then(|len| Response::with_bytes(&buf[..len]))
            }
            Command::PartitionErase { partition } => self.partition_erase(partition),
            Command::VersionInfoGet => {
                let running = self.version_of(self.auth_info.active);
                Response::with_payload(&VersionInfo {
                    version: &self.version,
                    running,
                })
            }
        };
        result.unwrap_or_else(|code| {
            log_warn!("command failed: {:?}", code);
            Response::failure(code)
        })
    }

    fn partition_erase(&mut self, partition: PartitionId) -> Result<Response, ErrorCode> {
        if partition == self.auth_info.active {
            log_warn!("refusing to erase the running image {:?}", partition);
            return Err(ErrorCode::InvalidPartitionId);
        }
        flashloader::partition_erase(&mut self.engine, &self.layout, partition)?;
        Ok(Response::success())
    }

    fn partition_info(&mut self) -> Result<PartitionInfo, ErrorCode> {
        let active = ActiveImageFlag::read(&mut self.engine, &self.layout).map_err(flash_error_code)?;
        let partitions = [PartitionId::A, PartitionId::B].map(|id| {
            let image = *self.layout.image(id);
            PartitionEntry {
                id,
                header_address: image.header,
                capacity: image.capacity(),
                declared_length: read_fw_length(&mut self.engine, &image),
                version: self.version_of(id),
            }
        });
        let geometry = self.engine.geometry();
        Ok(PartitionInfo {
            number_of_images: PARTITION_NUMBER as u8,
            active,
            booted: self.auth_info.active,
            partitions,
            flash_capacity: geometry.capacity(),
            subsector_size: geometry.subsector_size(),
            page_size: geometry.page_size,
            auth: (&self.auth_info).into(),
            writing: self.flashloader.is_writing(),
        })
    }

    fn version_of(&mut self, id: PartitionId) -> FwVersion {
        let image = *self.layout.image(id);
        let record = match read_fw_length(&mut self.engine, &image) {
            Some(len) => VersionRecord::read(&mut self.engine, image.header, len, image.body_capacity),
            None => VersionRecord::ERASED,
        };
        fw_version(record)
    }
}

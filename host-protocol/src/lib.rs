// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Management host to device flashloader protocol.
//! The host streams a signed image into the staging region page by page, then
//! asks the device to commit it into one of the two image partitions.
//! Framing and the transport CRC are handled by the link layer; this crate only
//! defines the typed messages carried inside a frame.

#![no_std]

use consts::{FLASH_LOADER_PAGE_BUF_SIZE, REQ_RESP_BUF_LENGTH};
use serde::{Deserialize, Serialize};


/// Version of the message set below. Bumped on any incompatible change.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum supported message size to be serialized or deserialized by `postcard`.
/// A write request carries a full page plus a handful of varint fields.
pub const MAX_MSG_SIZE: usize = FLASH_LOADER_PAGE_BUF_SIZE + 32;

/// Image partition addressed by a command.
/// Travels as the ASCII letter the host tools print (`'A'` or `'B'`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(try_from = "u8", into = "u8")]
pub enum PartitionId {
    A,
    B,
}

impl PartitionId {
    /// Slot index used for per-partition tables (A = 0, B = 1).
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }

    /// The partition that is not `self`.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn as_ascii(self) -> u8 {
        match self {
            Self::A => b'A',
            Self::B => b'B',
        }
    }
}

impl TryFrom<u8> for PartitionId {
    type Error = InvalidPartition;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'A' | b'a' => Ok(Self::A),
            b'B' | b'b' => Ok(Self::B),
            other => Err(InvalidPartition(other)),
        }
    }
}

impl From<PartitionId> for u8 {
    fn from(id: PartitionId) -> Self {
        id.as_ascii()
    }
}

/// A partition byte that is neither `'A'` nor `'B'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPartition(pub u8);

impl core::fmt::Display for InvalidPartition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid partition id {:#04x}", self.0)
    }
}

/// Flashloader commands sent by the host.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum Command<'a> {
    /// Reserved slot matching the legacy numbering, never accepted
    Null,
    /// Store one page of the image at `sequence * page size` in staging
    Write {
        partition: PartitionId,
        sequence: u32,
        page: &'a [u8],
    },
    /// Authenticate the staged image and install it into `partition`
    Commit { partition: PartitionId },
    /// Drop the current write transaction
    WriteAbort,
    /// Request adapter properties and per-partition details
    PartitionInfoGet,
    /// Read raw bytes of a partition, starting at its header
    FlashRead {
        partition: PartitionId,
        offset: u32,
        length: u32,
    },
    /// Erase a whole partition, header included
    PartitionErase { partition: PartitionId },
    /// Request the running firmware version string and record
    VersionInfoGet,
}

/// Number of [`Command`] variants.
const COMMAND_COUNT: u8 = 8;

/// A command together with the protocol version it was encoded for.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Request<'a> {
    pub version: u8,
    #[serde(borrow)]
    pub command: Command<'a>,
}

impl<'a> Request<'a> {
    pub fn new(command: Command<'a>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }

    /// Decode a request received from the host.
    ///
    /// This is the only place raw request bytes are interpreted.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, ErrorCode> {
        let req: Request<'a> = postcard::from_bytes(bytes).map_err(|e| match e {
            // Custom errors come from an unknown command index or a bad
            // partition letter. The index is the byte after the version.
            postcard::Error::SerdeDeCustom => match bytes.get(1) {
                Some(&index) if index < COMMAND_COUNT => ErrorCode::InvalidPartitionId,
                _ => ErrorCode::UnknownCommand,
            },
            _ => ErrorCode::DecodeError,
        })?;
        if req.version != PROTOCOL_VERSION {
            return Err(ErrorCode::UnsupportedVersion);
        }
        Ok(req)
    }

    pub fn encode<'b>(&self, buf: &'b mut [u8]) -> Result<&'b mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }
}

/// Outcome of a command.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Success,
    Failure,
}

/// Extended error codes reported in [`Response::error`].
///
/// The first thirteen values keep the numbering the host tools already know.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum ErrorCode {
    ReadParam = 1,
    InvalidReadLength = 2,
    AddressOutOfRange = 3,
    InvalidPartitionId = 4,
    DevInfoGet = 5,
    ParamsGet = 6,
    SubsectorErase = 7,
    SubsectorEraseTimeout = 8,
    PartitionValueWrite = 9,
    PartitionValueWriteTimeout = 10,
    FlashWriteTimeout = 11,
    FlashWriteFail = 12,
    CommitLengthOutOfRange = 13,
    AuthenticationError = 14,
    SequenceError = 15,
    NoTransaction = 16,
    InvalidPageLength = 17,
    DecodeError = 18,
    UnsupportedVersion = 19,
    CompareMismatch = 20,
    Uecc = 21,
    UnknownCommand = 22,
    FlashRead = 23,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        use ErrorCode::*;
        const ALL: [ErrorCode; 23] = [
            ReadParam,
            InvalidReadLength,
            AddressOutOfRange,
            InvalidPartitionId,
            DevInfoGet,
            ParamsGet,
            SubsectorErase,
            SubsectorEraseTimeout,
            PartitionValueWrite,
            PartitionValueWriteTimeout,
            FlashWriteTimeout,
            FlashWriteFail,
            CommitLengthOutOfRange,
            AuthenticationError,
            SequenceError,
            NoTransaction,
            InvalidPageLength,
            DecodeError,
            UnsupportedVersion,
            CompareMismatch,
            Uecc,
            UnknownCommand,
            FlashRead,
        ];
        ALL.iter().copied().find(|c| *c as u32 == value)
    }
}

/// Reply to every [`Command`].
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub status: Status,
    /// Zero on success, an [`ErrorCode`] value otherwise.
    pub error: u32,
    /// Command specific payload; its length is the payload length.
    pub payload: heapless::Vec<u8, REQ_RESP_BUF_LENGTH>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            error: 0,
            payload: heapless::Vec::new(),
        }
    }

    pub fn failure(code: ErrorCode) -> Self {
        Self {
            status: Status::Failure,
            error: code as u32,
            payload: heapless::Vec::new(),
        }
    }

    /// Successful response carrying raw bytes.
    pub fn with_bytes(bytes: &[u8]) -> Result<Self, ErrorCode> {
        let payload = heapless::Vec::from_slice(bytes).map_err(|_| ErrorCode::InvalidReadLength)?;
        Ok(Self {
            status: Status::Success,
            error: 0,
            payload,
        })
    }

    /// Successful response carrying a postcard encoded value.
    pub fn with_payload<T: Serialize>(value: &T) -> Result<Self, ErrorCode> {
        let mut buf = [0u8; REQ_RESP_BUF_LENGTH];
        let used = postcard::to_slice(value, &mut buf).map_err(|_| ErrorCode::ParamsGet)?;
        Self::with_bytes(used)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.error)
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Decode the payload of a successful response.
    pub fn payload_as<'de, T: Deserialize<'de>>(&'de self) -> Result<T, postcard::Error> {
        postcard::from_bytes(&self.payload)
    }

    pub fn encode<'b>(&self, buf: &'b mut [u8]) -> Result<&'b mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Payload of a successful [`Command::Write`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteAck {
    pub sequence: u32,
    /// CRC32 (iSCSI) of the page as it was programmed.
    pub crc: u32,
}

/// Version record stored at the tail of an image body.
/// All fields read `0xFFFF_FFFF` when the partition holds no valid image.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FwVersion {
    pub major: u32,
    pub minor: u32,
    pub build_patch: u32,
    pub build_number: u32,
    /// `mmddyyyy`
    pub build_date: u32,
}

/// Per-partition part of [`PartitionInfo`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartitionEntry {
    pub id: PartitionId,
    pub header_address: u32,
    /// Header plus body capacity in bytes.
    pub capacity: u32,
    /// Body length declared by the stored header, if it parses.
    pub declared_length: Option<u32>,
    pub version: FwVersion,
}

/// Redundancy diagnostics gathered during the boot time synchronization.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AuthSummary {
    pub active_index: u8,
    pub redundant_index: u8,
    /// Indexed by partition (A = 0, B = 1).
    pub failed_authentication: [bool; 2],
    pub uecc_detected: [bool; 2],
    pub uecc_compare: bool,
    pub image_updated: bool,
}

/// Payload of a successful [`Command::PartitionInfoGet`].
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct PartitionInfo {
    pub number_of_images: u8,
    /// Partition the active image flag currently selects.
    pub active: PartitionId,
    /// Partition the running image was loaded from.
    pub booted: PartitionId,
    pub partitions: [PartitionEntry; 2],
    pub flash_capacity: u32,
    pub subsector_size: u32,
    pub page_size: u32,
    pub auth: AuthSummary,
    /// A write transaction is in progress.
    pub writing: bool,
}

/// Payload of a successful [`Command::VersionInfoGet`].
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct VersionInfo<'a> {
    pub version: &'a str,
    pub running: FwVersion,
}

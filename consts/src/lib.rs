// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed flash layout and protocol sizes shared by the boot and update code.
//! All addresses are byte offsets from the start of the SPI NOR array.

#![no_std]

/// Nominal capacity of the SPI NOR device (8 MiB).
pub const FLASH_SIZE: u32 = 8 * 1024 * 1024;

/// Part of the array usable once inline ECC is enabled.
/// The controller stores 8 ECC bytes for every 24 data bytes, so only three
/// quarters of the raw capacity hold data.
pub const FLASH_USABLE_SIZE: u32 = FLASH_SIZE / 32 * 24;

/// Largest subsector the erase/program engine can buffer in RAM.
/// A device reporting a bigger erase unit is refused at init.
pub const MAX_SUBSECTOR_SIZE: usize = 4096;

/// Primary boot stage. Never touched by the update code.
pub const PBOOT_ADDR: u32 = 0;
pub const PBOOT_SIZE: u32 = 256 * 1024;

/// Active image flag cell.
/// Only the low bit of the first byte is meaningful: 0 selects image A,
/// 1 selects image B. The cell shares its subsector with the image A header.
pub const ACTIVE_IMG_FLAG_ADDR: u32 = PBOOT_ADDR + PBOOT_SIZE;
pub const ACTIVE_IMG_FLAG_SIZE: u32 = 2 * 1024;
pub const ACTIVE_IMG_MASK: u8 = 0x01;
pub const ACTIVE_IMG_A: u8 = 0;
pub const ACTIVE_IMG_B: u8 = 1;

/// Size of the signed header in front of every image body.
pub const IMG_HDR_SIZE: u32 = 2048;

/// Image A header and body.
pub const IMG_A_HDR_ADDR: u32 = ACTIVE_IMG_FLAG_ADDR + ACTIVE_IMG_FLAG_SIZE;
pub const IMG_A_ADDR: u32 = IMG_A_HDR_ADDR + IMG_HDR_SIZE;
pub const IMG_A_SIZE: u32 = 1024 * 1024;

/// Configuration log that follows image A. Owned by the runtime config store.
pub const IMG_A_CFG_LOG_ADDR: u32 = IMG_A_ADDR + IMG_A_SIZE;
pub const IMG_A_CFG_LOG_SIZE: u32 = 128 * 1024;

/// Gap between the image A log and the image B header.
pub const RESERVED_ADDR: u32 = IMG_A_CFG_LOG_ADDR + IMG_A_CFG_LOG_SIZE;
pub const RESERVED_SIZE: u32 = 2 * 1024;

/// Image B header and body.
pub const IMG_B_HDR_ADDR: u32 = RESERVED_ADDR + RESERVED_SIZE;
pub const IMG_B_ADDR: u32 = IMG_B_HDR_ADDR + IMG_HDR_SIZE;
pub const IMG_B_SIZE: u32 = 1024 * 1024;

pub const IMG_B_CFG_LOG_ADDR: u32 = IMG_B_ADDR + IMG_B_SIZE;
pub const IMG_B_CFG_LOG_SIZE: u32 = 128 * 1024;

/// Staging region written by the host before a commit.
/// Holds one header plus one body, so its capacity bounds the declared
/// length of anything the flashloader accepts.
pub const UPGRADE_ADDR: u32 = IMG_B_CFG_LOG_ADDR + IMG_B_CFG_LOG_SIZE;
pub const UPGRADE_SIZE: u32 = 1024 * 1024;

/// Crash dump regions. Managed by the crash log, listed so the layout end is
/// checked against the device.
pub const CRASH_DUMP_A_ADDR: u32 = UPGRADE_ADDR + UPGRADE_SIZE;
pub const CRASH_DUMP_A_SIZE: u32 = 1024 * 1024;
pub const CRASH_DUMP_B_ADDR: u32 = CRASH_DUMP_A_ADDR + CRASH_DUMP_A_SIZE;
pub const CRASH_DUMP_B_SIZE: u32 = 1024 * 1024;

/// First byte past the last region in use.
pub const LAYOUT_END: u32 = CRASH_DUMP_B_ADDR + CRASH_DUMP_B_SIZE + UNUSED_SIZE;
pub const UNUSED_SIZE: u32 = 504 * 1024;

/// Number of image partitions (A and B).
pub const PARTITION_NUMBER: usize = 2;

/// Bytes carried by one flashloader write message.
/// Matches one program page on the supported parts.
pub const FLASH_LOADER_PAGE_BUF_SIZE: usize = 256;

/// Largest payload a single flashloader response may carry.
pub const REQ_RESP_BUF_LENGTH: usize = 256;

/// Length of the firmware version string reported to the host.
pub const FW_VERSION_STR_LEN: usize = 128;

/// Number of RSA public keys fused into the trusted key table.
pub const NUM_PUBLIC_KEYS: usize = 4;

/// RSA-4096 modulus length in bytes.
pub const PUB_KEY_LENGTH: usize = 512;

/// Public exponent shared by every trusted key.
pub const PUB_KEY_EXPONENT: u32 = 65537;

// The whole map has to fit in the ECC-protected part of the device.
const _: () = assert!(LAYOUT_END == FLASH_USABLE_SIZE);

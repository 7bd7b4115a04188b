// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware image maintenance on the external SPI NOR flash.
//!
//! * [`Engine`] erases arbitrary byte ranges without losing neighbouring data
//!   and copies between regions.
//! * [`Flashloader`] implements the host update protocol: stage, authenticate,
//!   install, and only then switch the active image flag.
//! * [`sync`] keeps the image that did not boot identical to the one that did.
//!
//! [`FlashUpdateContext`] owns all of it for one boot.

#![no_std]

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod context;
pub mod device;
pub mod engine;
pub mod flashloader;
pub mod layout;
pub mod sync;

#[cfg(test)]
mod tests;

pub use {
    context::{FlashUpdateContext, InitError},
    device::{Clock, DeviceFault, DeviceStatus, FlashGeometry, SpiNorFlash},
    engine::{Engine, FlashError},
    flashloader::{Flashloader, FlashloaderState},
    layout::{ActiveImageFlag, ImagePartition, LayoutError, PartitionLayout, Region},
    sync::{AuthInfo, BootHandoff, HandoffImage, SyncError, SyncOutcome},
};

// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot time A/B redundancy repair.
//!
//! The primary boot stage authenticates the nominal active image and, if that
//! fails, the other one, then runs whichever passed. Once per boot this module
//! checks the copy that did not run and, when it fails authentication or
//! carries a different build number, replaces it with the running image.

use {
    crate::{
        device::{Clock, SpiNorFlash},
        layout::{ImagePartition, PartitionLayout},
        Engine, FlashError,
    },
    fw_image::{
        Authenticator, ImageHasher, ImageHeader, ImageId, ImageStatus, KeyValidity,
        SignatureVerify, VersionRecord,
    },
    host_protocol::{AuthSummary, PartitionId},
};

/// One image as reported by the primary boot stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandoffImage {
    pub partition: PartitionId,
    pub status: ImageStatus,
}

/// Hand-off record left by the primary boot stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootHandoff {
    /// Nominal active image first, nominal redundant image second.
    pub images: [HandoffImage; 2],
}

impl BootHandoff {
    /// Hand-off for the flag selecting `active`.
    pub fn new(active: PartitionId, active_status: ImageStatus, redundant_status: ImageStatus) -> Self {
        Self {
            images: [
                HandoffImage {
                    partition: active,
                    status: active_status,
                },
                HandoffImage {
                    partition: active.other(),
                    status: redundant_status,
                },
            ],
        }
    }

    /// The partition that actually booted and the one to keep in sync with
    /// it, or `None` if the primary boot stage trusted neither.
    pub fn roles(&self) -> Option<(PartitionId, PartitionId)> {
        let [nominal_active, nominal_redundant] = self.images;
        if nominal_active.status.is_success() {
            Some((nominal_active.partition, nominal_redundant.partition))
        } else if nominal_redundant.status.is_success() {
            // Fallback boot: the nominal redundant copy is the one running.
            Some((nominal_redundant.partition, nominal_active.partition))
        } else {
            None
        }
    }
}

/// Diagnostics of one synchronization pass. Rebuilt every boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AuthInfo {
    pub active: PartitionId,
    pub redundant: PartitionId,
    /// Indexed by [`PartitionId::index`].
    pub failed_authentication: [bool; 2],
    pub uecc_detected: [bool; 2],
    pub uecc_compare: bool,
    pub image_updated: bool,
}

impl AuthInfo {
    pub fn new(active: PartitionId) -> Self {
        Self {
            active,
            redundant: active.other(),
            failed_authentication: [false; 2],
            uecc_detected: [false; 2],
            uecc_compare: false,
            image_updated: false,
        }
    }
}

impl From<&AuthInfo> for AuthSummary {
    fn from(info: &AuthInfo) -> Self {
        Self {
            active_index: info.active.index() as u8,
            redundant_index: info.redundant.index() as u8,
            failed_authentication: info.failed_authentication,
            uecc_detected: info.uecc_detected,
            uecc_compare: info.uecc_compare,
            image_updated: info.image_updated,
        }
    }
}

/// Result of one synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncOutcome {
    /// The redundant copy authenticates and has the same build number.
    InSync,
    /// The redundant copy was rewritten from the running image.
    Repaired { target: PartitionId },
    /// The repair was abandoned; the running image was not touched.
    Failed { target: PartitionId, reason: SyncError },
    /// The hand-off names no authenticated image to copy from.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncError {
    /// The running image's header could not be read back.
    ActiveHeader,
    /// The running image does not fit the redundant partition.
    Length,
    Erase(FlashError),
    Copy(FlashError),
    Compare(FlashError),
    /// The copy reads back differently at this address.
    Mismatch(u32),
}

fn image_id(partition: PartitionId) -> ImageId {
    match partition {
        PartitionId::A => ImageId::A,
        PartitionId::B => ImageId::B,
    }
}

/// Run one synchronization pass. Never retries and never fails the boot.
pub fn synchronize<D, C, H, V, K>(
    engine: &mut Engine<D, C>,
    authenticator: &mut Authenticator<'_, H, V, K>,
    layout: &PartitionLayout,
    handoff: &BootHandoff,
) -> (AuthInfo, SyncOutcome)
where
    D: SpiNorFlash,
    C: Clock,
    H: ImageHasher,
    V: SignatureVerify,
    K: KeyValidity,
{
    let Some((active, redundant)) = handoff.roles() else {
        log_warn!("hand-off names no authenticated image, skipping redundancy check");
        let mut info = AuthInfo::new(handoff.images[0].partition);
        for image in handoff.images {
            info.failed_authentication[image.partition.index()] = !image.status.is_success();
        }
        return (info, SyncOutcome::Skipped);
    };
    if active != handoff.images[0].partition {
        log_warn!("booted from fallback image {:?}", active);
    }

    let mut info = AuthInfo::new(active);
    let outcome = match run(engine, authenticator, layout, active, redundant, &mut info) {
        Ok(outcome) => outcome,
        Err(reason) => {
            log_error!("redundancy repair of {:?} abandoned: {:?}", redundant, reason);
            SyncOutcome::Failed {
                target: redundant,
                reason,
            }
        }
    };
    (info, outcome)
}

fn run<D, C, H, V, K>(
    engine: &mut Engine<D, C>,
    authenticator: &mut Authenticator<'_, H, V, K>,
    layout: &PartitionLayout,
    active: PartitionId,
    redundant: PartitionId,
    info: &mut AuthInfo,
) -> Result<SyncOutcome, SyncError>
where
    D: SpiNorFlash,
    C: Clock,
    H: ImageHasher,
    V: SignatureVerify,
    K: KeyValidity,
{
    let source = *layout.image(active);
    let target = *layout.image(redundant);
    let (a, r) = (active.index(), redundant.index());

    engine.take_uecc();
    let fw_length = read_fw_length(engine, &source).ok_or(SyncError::ActiveHeader)?;
    info.uecc_detected[a] |= engine.take_uecc();

    let check = authenticator.authenticate_image(
        &mut *engine,
        target.header,
        image_id(redundant),
        target.body_capacity,
    );
    info.uecc_detected[r] |= engine.take_uecc();

    if check.status.is_success() {
        let active_version = VersionRecord::read(&mut *engine, source.header, fw_length, source.body_capacity);
        let redundant_version = read_fw_length(engine, &target)
            .map(|len| VersionRecord::read(&mut *engine, target.header, len, target.body_capacity))
            .unwrap_or(VersionRecord::ERASED);
        if active_version.build_number == redundant_version.build_number {
            log_info!(
                "image {:?} in sync with {:?} (build {})",
                redundant,
                active,
                active_version.build_number
            );
            return Ok(SyncOutcome::InSync);
        }
        log_info!(
            "image {:?} build {} differs from running build {}",
            redundant,
            redundant_version.build_number,
            active_version.build_number
        );
    } else {
        info.failed_authentication[r] = true;
    }

    let image_length = fw_length
        .checked_add(ImageHeader::SIZE as u32)
        .filter(|&len| len <= target.capacity())
        .ok_or(SyncError::Length)?;

    log_info!("repairing image {:?} from {:?}", redundant, active);
    engine.take_uecc();
    let erased = engine.erase(target.header, target.capacity());
    info.uecc_detected[r] |= engine.take_uecc();
    erased.map_err(SyncError::Erase)?;

    let copied = engine.copy(source.header, target.header, image_length);
    if let Err(FlashError::Uecc { address }) = copied {
        let idx = if source.region().start <= address && address < source.region().end() {
            a
        } else {
            r
        };
        info.uecc_detected[idx] = true;
    }
    engine.take_uecc();
    copied.map_err(SyncError::Copy)?;

    let compared = engine.compare(source.header, target.header, image_length);
    info.uecc_compare |= engine.take_uecc();
    if let Some(address) = compared.map_err(SyncError::Compare)? {
        return Err(SyncError::Mismatch(address));
    }

    info.image_updated = true;
    log_info!("image {:?} repaired, {} bytes copied", redundant, image_length);
    Ok(SyncOutcome::Repaired { target: redundant })
}

/// Declared body length of the image in `partition`, if its header parses.
pub(crate) fn read_fw_length<D: SpiNorFlash, C: Clock>(
    engine: &mut Engine<D, C>,
    partition: &ImagePartition,
) -> Option<u32> {
    let mut raw = [0u8; ImageHeader::SIZE];
    engine.read(partition.header, &mut raw).ok()?;
    ImageHeader::parse_unverified(&raw).ok().map(|h| h.fw_length())
}

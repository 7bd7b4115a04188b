// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    crate::{
        AuthBlock, ContextBlock, Digest, Error, HashAlgorithm, HashError, ImageHasher,
        ImageHeader, ImageSource, KeyValidity, PublicKey, SignatureVerify, VerificationResult,
    },
    consts::NUM_PUBLIC_KEYS,
};

/// Bytes of body streamed through the hash engine per read.
const HASH_CHUNK: usize = 1024;

/// Authentication status of one image.
///
/// Only [`ImageStatus::Success`] may be trusted. Every other value means the
/// image must not be booted or installed, whatever the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum ImageStatus {
    NotTested = 0,
    Success = 1,
    KeyRevoked = 2,
    InvalidHash = 3,
    InvalidKeyIndex = 4,
    InvalidLength = 5,
    InvalidHashAlgo = 6,
    /// The context block could not be transferred or its CRC is wrong.
    ContextDma = 7,
    /// The authentication block could not be transferred.
    ImageAuthDma = 8,
    /// The body could not be transferred.
    ImageDma = 9,
    InvalidSignature = 10,
    ShaError = 11,
    PkaError = 12,
    InvalidMemType = 13,
}

impl ImageStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Which copy of the firmware a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageId {
    A,
    B,
    Upgrade,
}

/// One authentication attempt. Built fresh for every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageDescriptor {
    /// Address of the image header.
    pub address: u32,
    pub id: ImageId,
    pub status: ImageStatus,
    /// Detail for the status: the failing address for transfer errors, the
    /// offending value for field errors, zero otherwise.
    pub extended_error: u32,
}

impl ImageDescriptor {
    pub fn new(address: u32, id: ImageId) -> Self {
        Self {
            address,
            id,
            status: ImageStatus::NotTested,
            extended_error: 0,
        }
    }
}

/// Image authentication gate.
///
/// Owns the trusted key table and the crypto engines. The secure boot policy
/// is applied here and nowhere else: with secure boot off, a signature that
/// does not verify is tolerated, but the fingerprint must still match.
pub struct Authenticator<'k, H, V, K> {
    keys: &'k [PublicKey; NUM_PUBLIC_KEYS],
    hasher: H,
    verifier: V,
    key_validity: K,
    secure_boot: bool,
}

impl<'k, H, V, K> Authenticator<'k, H, V, K>
where
    H: ImageHasher,
    V: SignatureVerify,
    K: KeyValidity,
{
    pub fn new(
        keys: &'k [PublicKey; NUM_PUBLIC_KEYS],
        hasher: H,
        verifier: V,
        key_validity: K,
        secure_boot: bool,
    ) -> Self {
        Self {
            keys,
            hasher,
            verifier,
            key_validity,
            secure_boot,
        }
    }

    pub fn secure_boot(&self) -> bool {
        self.secure_boot
    }

    /// Authenticate `images` in order and stop at the first one that passes.
    ///
    /// Every descriptor up to and including the returned index has its status
    /// filled in; the rest stay [`ImageStatus::NotTested`]. `max_len` bounds
    /// the declared body length and is checked before any hashing.
    pub fn authenticate(
        &mut self,
        source: &mut impl ImageSource,
        images: &mut [ImageDescriptor],
        max_len: u32,
    ) -> Option<usize> {
        for (idx, image) in images.iter_mut().enumerate() {
            let (status, detail) = match self.authenticate_one(source, image.address, max_len) {
                Ok(()) => (ImageStatus::Success, 0),
                Err(failure) => failure,
            };
            image.status = status;
            image.extended_error = detail;
            if status.is_success() {
                log_info!("image {:?} at {:#x} authenticated", image.id, image.address);
                return Some(idx);
            }
            log_warn!(
                "image {:?} at {:#x} failed authentication: {:?} ({:#x})",
                image.id,
                image.address,
                status,
                detail
            );
        }
        None
    }

    /// Authenticate the single image whose header is at `address`.
    pub fn authenticate_image(
        &mut self,
        source: &mut impl ImageSource,
        address: u32,
        id: ImageId,
        max_len: u32,
    ) -> ImageDescriptor {
        let mut image = [ImageDescriptor::new(address, id)];
        self.authenticate(source, &mut image, max_len);
        image[0]
    }

    fn authenticate_one(
        &mut self,
        source: &mut impl ImageSource,
        address: u32,
        max_len: u32,
    ) -> Result<(), (ImageStatus, u32)> {
        const CF1: u32 = 3;
        const CF2: u32 = 5;
        const CF3: u32 = 7;
        const CF4: u32 = 11;
        const CF5: u32 = 13;
        const CF6: u32 = 17;
        let mut control_flow_integrity_counter = 0;

        if !source.is_image_memory(address, ImageHeader::SIZE as u32) {
            return Err((ImageStatus::InvalidMemType, address));
        }

        let mut raw_auth = [0u8; AuthBlock::SIZE];
        source
            .read_image(address, &mut raw_auth)
            .map_err(|_| (ImageStatus::ImageAuthDma, address))?;
        let auth = AuthBlock::deserialize(&raw_auth).map_err(|_| (ImageStatus::ImageAuthDma, address))?;

        let context_address = address + ImageHeader::CONTEXT_OFFSET as u32;
        let mut raw_context = [0u8; ContextBlock::SIZE];
        source
            .read_image(context_address, &mut raw_context)
            .map_err(|_| (ImageStatus::ContextDma, context_address))?;
        let context = match ContextBlock::parse(&raw_context) {
            Ok(context) => context,
            Err(Error::ContextCrcMismatch { computed, .. }) => {
                return Err((ImageStatus::ContextDma, computed))
            }
            Err(_) => return Err((ImageStatus::ContextDma, context_address)),
        };
        control_flow_integrity_counter += CF1;

        // The length is checked before any hash or signature work is started.
        let fw_length = context.fw_length();
        if fw_length == 0 || fw_length > max_len {
            return Err((ImageStatus::InvalidLength, fw_length));
        }
        let body_address = address + ImageHeader::SIZE as u32;
        if !source.is_image_memory(body_address, fw_length) {
            return Err((ImageStatus::InvalidMemType, body_address));
        }
        control_flow_integrity_counter += CF2;

        let algorithm = context
            .hash_algorithm()
            .ok_or((ImageStatus::InvalidHashAlgo, context.hash_algorithm_id()))?;

        let key_idx = context.key_selector();
        let keys = self.keys;
        let key = keys
            .get(key_idx as usize)
            .ok_or((ImageStatus::InvalidKeyIndex, key_idx))?;
        if !self.key_validity.is_key_valid(key_idx as usize) {
            return Err((ImageStatus::KeyRevoked, key_idx));
        }
        control_flow_integrity_counter += CF3;

        let digest = self.hash_image(source, algorithm, &raw_context, body_address, fw_length)?;
        control_flow_integrity_counter += CF4;

        match self.verifier.verify_rsa(key, digest.as_bytes(), auth.signature()) {
            Ok(VerificationResult::Valid) => {}
            Ok(VerificationResult::Invalid) if !self.secure_boot => {
                log_warn!("signature invalid, accepted because secure boot is off");
            }
            Ok(VerificationResult::Invalid) => return Err((ImageStatus::InvalidSignature, key_idx)),
            Err(_) => return Err((ImageStatus::PkaError, key_idx)),
        }
        control_flow_integrity_counter += CF5;

        if !auth.fingerprint_matches(&digest) {
            return Err((ImageStatus::InvalidHash, 0));
        }
        if core::hint::black_box(auth.fingerprint_matches(&digest)) {
            control_flow_integrity_counter += CF6;
        }

        if core::hint::black_box(control_flow_integrity_counter) == CF1 + CF2 + CF3 + CF4 + CF5 + CF6 {
            Ok(())
        } else {
            Err((ImageStatus::InvalidHash, control_flow_integrity_counter))
        }
    }

    /// Digest of the raw context block followed by the declared body.
    fn hash_image(
        &mut self,
        source: &mut impl ImageSource,
        algorithm: HashAlgorithm,
        raw_context: &[u8],
        body_address: u32,
        fw_length: u32,
    ) -> Result<Digest, (ImageStatus, u32)> {
        let sha_error = |e: HashError| match e {
            HashError::Unsupported => (ImageStatus::InvalidHashAlgo, algorithm as u32),
            HashError::Engine => (ImageStatus::ShaError, 0),
        };

        self.hasher.start(algorithm).map_err(sha_error)?;
        self.hasher.update(raw_context).map_err(sha_error)?;

        let mut chunk = [0u8; HASH_CHUNK];
        let mut offset = 0;
        while offset < fw_length {
            let len = (fw_length - offset).min(HASH_CHUNK as u32) as usize;
            let address = body_address + offset;
            source
                .read_image(address, &mut chunk[..len])
                .map_err(|_| (ImageStatus::ImageDma, address))?;
            self.hasher.update(&chunk[..len]).map_err(sha_error)?;
            offset += len as u32;
        }

        let digest = self.hasher.finish().map_err(sha_error)?;
        if digest.as_bytes().len() != algorithm.digest_len() {
            return Err((ImageStatus::ShaError, digest.as_bytes().len() as u32));
        }
        log_debug!("digest over {} body bytes computed", fw_length);
        Ok(digest)
    }
}

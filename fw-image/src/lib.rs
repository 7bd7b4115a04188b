// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Signed firmware image format for the SPI NOR partitions.
//!
//! Every partition starts with a 2 KiB [`ImageHeader`]: an authentication
//! block (fingerprint and RSA signature) followed by a [`ContextBlock`]
//! describing the body. The fingerprint is the digest of the raw context block
//! followed by the declared body bytes, and the signature is computed over that
//! digest.

#![no_std]

mod fmt;

mod auth;
mod sha;
mod version;

#[cfg(test)]
mod tests;

pub use {
    auth::{Authenticator, ImageDescriptor, ImageId, ImageStatus},
    sha::Sha2Hasher,
    version::VersionRecord,
};

use consts::PUB_KEY_LENGTH;
use crc::{Crc, CRC_32_ISO_HDLC};

/// RSA-4096 public key modulus.
pub type PublicKey = [u8; PUB_KEY_LENGTH];

/// Size of the stored fingerprint. Shorter digests are zero padded.
pub const FINGERPRINT_SIZE: usize = 128;

/// Size of the RSA-4096 signature.
pub const SIGNATURE_SIZE: usize = 512;

/// Longest digest produced by any supported algorithm.
pub const MAX_DIGEST_SIZE: usize = 64;

const CONTEXT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Hash algorithm identifiers as stored in the context block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum HashAlgorithm {
    Sha1 = 0,
    Sha224 = 1,
    Sha256 = 2,
    Sha384 = 3,
    Sha512 = 4,
    Sha3_512 = 5,
}

impl HashAlgorithm {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::Sha1),
            1 => Some(Self::Sha224),
            2 => Some(Self::Sha256),
            3 => Some(Self::Sha384),
            4 => Some(Self::Sha512),
            5 => Some(Self::Sha3_512),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 | Self::Sha3_512 => 64,
        }
    }
}

bitflags::bitflags! {
    /// Body encoding flags. Each one is stored as its own 32-bit word in the
    /// context block; any non-zero word sets the flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u32 {
        /// The body is compressed.
        const COMPRESSED = 1 << 0;
        /// The fingerprint was computed over the compressed body.
        const HASH_SOURCE_COMPRESSED = 1 << 1;
        /// The body is a raw ELF file rather than a loadable binary.
        const RAW_ELF = 1 << 2;
    }
}

/// Message digest of up to [`MAX_DIGEST_SIZE`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest {
    bytes: [u8; MAX_DIGEST_SIZE],
    len: usize,
}

impl Digest {
    /// Returns `None` if `bytes` is longer than [`MAX_DIGEST_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_DIGEST_SIZE {
            return None;
        }
        let mut digest = Self {
            bytes: [0; MAX_DIGEST_SIZE],
            len: bytes.len(),
        };
        digest.bytes[..bytes.len()].copy_from_slice(bytes);
        Some(digest)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Streaming hash engine.
pub trait ImageHasher {
    /// Reset the engine for a new digest.
    fn start(&mut self, algorithm: HashAlgorithm) -> Result<(), HashError>;

    fn update(&mut self, data: &[u8]) -> Result<(), HashError>;

    fn finish(&mut self) -> Result<Digest, HashError>;
}

/// Hash engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HashError {
    /// The engine does not implement the requested algorithm.
    Unsupported,
    /// The engine reported a fault or was used out of order.
    Engine,
}

/// RSA-4096 signature verification with the fixed public exponent.
pub trait SignatureVerify {
    /// Verify `signature` over `digest` with the given modulus.
    ///
    /// `Err` means the public key accelerator itself failed, as opposed to the
    /// signature being wrong.
    fn verify_rsa(
        &self,
        modulus: &PublicKey,
        digest: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<VerificationResult, PkaFault>;
}

/// RSA-4096 signing, used when building images off-device.
pub trait ImageSign {
    fn sign_rsa(&self, key_selector: u32, digest: &[u8]) -> [u8; SIGNATURE_SIZE];
}

/// Public key accelerator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkaFault;

/// Hardware key revocation oracle, usually backed by fuses.
pub trait KeyValidity {
    fn is_key_valid(&self, index: usize) -> bool;
}

/// Bounded read access to the memory an image lives in.
pub trait ImageSource {
    fn read_image(&mut self, address: u32, buf: &mut [u8]) -> Result<(), ReadFault>;

    /// Whether `[address, address + len)` lies in memory images may be
    /// authenticated from.
    fn is_image_memory(&self, address: u32, len: u32) -> bool;
}

/// A read transfer did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFault;

/// Verification result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum VerificationResult {
    // The values are arbitrary, but chosen to be different by more than one bit to make glitching
    // attacks more difficult.
    Valid = 0xcafebabe,
    Invalid = 0xdeadbeef,
}

/// Authentication block: the first part of every header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBlock {
    fingerprint: [u8; FINGERPRINT_SIZE],
    signature: [u8; SIGNATURE_SIZE],
}

impl AuthBlock {
    pub const SIZE: usize = FINGERPRINT_SIZE + SIGNATURE_SIZE;

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::HeaderTooShort);
        }
        let mut block = Self {
            fingerprint: [0; FINGERPRINT_SIZE],
            signature: [0; SIGNATURE_SIZE],
        };
        block.fingerprint.copy_from_slice(&data[..FINGERPRINT_SIZE]);
        block.signature.copy_from_slice(&data[FINGERPRINT_SIZE..Self::SIZE]);
        Ok(block)
    }

    pub fn serialize(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::SerializeBufferTooSmall);
        }
        buf[..FINGERPRINT_SIZE].copy_from_slice(&self.fingerprint);
        buf[FINGERPRINT_SIZE..Self::SIZE].copy_from_slice(&self.signature);
        Ok(())
    }

    pub fn fingerprint(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.fingerprint
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.signature
    }

    /// Whether the stored fingerprint is `digest` followed by zero padding.
    pub fn fingerprint_matches(&self, digest: &Digest) -> bool {
        let (head, tail) = self.fingerprint.split_at(digest.len);
        head == digest.as_bytes() && tail.iter().all(|&b| b == 0)
    }
}

/// Context block: describes the body that follows the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlock {
    fw_length: [u8; 4],
    public_key_selector: [u8; 4],
    hash_algorithm: [u8; 4],
    image_comp_flag: [u8; 4],
    hash_src_comp_flag: [u8; 4],
    raw_elf_image_flag: [u8; 4],
    loader_version: [u8; 4],
    next_image_public_key_1: PublicKey,
    next_image_public_key_2: PublicKey,
    crc: [u8; 4],
}

impl ContextBlock {
    /// Size of the context block in bytes.
    pub const SIZE: usize = 1408;

    /// The CRC covers every byte in front of it.
    pub const CRC_OFFSET: usize = Self::SIZE - 4;

    const NEXT_KEY_1: usize = 128;
    const NEXT_KEY_2: usize = Self::NEXT_KEY_1 + PUB_KEY_LENGTH;

    pub fn new(
        fw_length: u32,
        key_selector: u32,
        algorithm: HashAlgorithm,
        flags: ImageFlags,
        loader_version: u32,
        next_keys: [Option<&PublicKey>; 2],
    ) -> Self {
        let word = |f: ImageFlags| u32::from(flags.contains(f)).to_le_bytes();
        let mut context = Self {
            fw_length: fw_length.to_le_bytes(),
            public_key_selector: key_selector.to_le_bytes(),
            hash_algorithm: (algorithm as u32).to_le_bytes(),
            image_comp_flag: word(ImageFlags::COMPRESSED),
            hash_src_comp_flag: word(ImageFlags::HASH_SOURCE_COMPRESSED),
            raw_elf_image_flag: word(ImageFlags::RAW_ELF),
            loader_version: loader_version.to_le_bytes(),
            next_image_public_key_1: *next_keys[0].unwrap_or(&[0; PUB_KEY_LENGTH]),
            next_image_public_key_2: *next_keys[1].unwrap_or(&[0; PUB_KEY_LENGTH]),
            crc: [0; 4],
        };
        let mut buf = [0u8; Self::SIZE];
        context.write_fields(&mut buf);
        context.crc = CONTEXT_CRC.checksum(&buf[..Self::CRC_OFFSET]).to_le_bytes();
        context
    }

    /// Parse a context block and check its CRC.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::HeaderTooShort);
        }
        let data = &data[..Self::SIZE];
        let word = |at: usize| -> [u8; 4] {
            let mut w = [0; 4];
            w.copy_from_slice(&data[at..at + 4]);
            w
        };
        let mut context = Self {
            fw_length: word(0),
            public_key_selector: word(4),
            hash_algorithm: word(8),
            image_comp_flag: word(12),
            hash_src_comp_flag: word(16),
            raw_elf_image_flag: word(20),
            loader_version: word(24),
            next_image_public_key_1: [0; PUB_KEY_LENGTH],
            next_image_public_key_2: [0; PUB_KEY_LENGTH],
            crc: word(Self::CRC_OFFSET),
        };
        context
            .next_image_public_key_1
            .copy_from_slice(&data[Self::NEXT_KEY_1..Self::NEXT_KEY_2]);
        context
            .next_image_public_key_2
            .copy_from_slice(&data[Self::NEXT_KEY_2..Self::NEXT_KEY_2 + PUB_KEY_LENGTH]);

        let computed = CONTEXT_CRC.checksum(&data[..Self::CRC_OFFSET]);
        if computed != context.crc() {
            return Err(Error::ContextCrcMismatch {
                stored: context.crc(),
                computed,
            });
        }
        Ok(context)
    }

    /// Serialize the context block. Exactly [`Self::SIZE`] bytes will be
    /// written, unused bytes as zero.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::SerializeBufferTooSmall);
        }
        self.write_fields(&mut buf[..Self::SIZE]);
        buf[Self::CRC_OFFSET..Self::SIZE].copy_from_slice(&self.crc);
        Ok(())
    }

    fn write_fields(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(&self.fw_length);
        buf[4..8].copy_from_slice(&self.public_key_selector);
        buf[8..12].copy_from_slice(&self.hash_algorithm);
        buf[12..16].copy_from_slice(&self.image_comp_flag);
        buf[16..20].copy_from_slice(&self.hash_src_comp_flag);
        buf[20..24].copy_from_slice(&self.raw_elf_image_flag);
        buf[24..28].copy_from_slice(&self.loader_version);
        buf[Self::NEXT_KEY_1..Self::NEXT_KEY_2].copy_from_slice(&self.next_image_public_key_1);
        buf[Self::NEXT_KEY_2..Self::NEXT_KEY_2 + PUB_KEY_LENGTH]
            .copy_from_slice(&self.next_image_public_key_2);
    }

    /// Declared body length in bytes.
    pub fn fw_length(&self) -> u32 {
        u32::from_le_bytes(self.fw_length)
    }

    /// Index into the trusted key table.
    pub fn key_selector(&self) -> u32 {
        u32::from_le_bytes(self.public_key_selector)
    }

    pub fn hash_algorithm_id(&self) -> u32 {
        u32::from_le_bytes(self.hash_algorithm)
    }

    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        HashAlgorithm::from_id(self.hash_algorithm_id())
    }

    pub fn flags(&self) -> ImageFlags {
        let mut flags = ImageFlags::empty();
        flags.set(ImageFlags::COMPRESSED, self.image_comp_flag != [0; 4]);
        flags.set(
            ImageFlags::HASH_SOURCE_COMPRESSED,
            self.hash_src_comp_flag != [0; 4],
        );
        flags.set(ImageFlags::RAW_ELF, self.raw_elf_image_flag != [0; 4]);
        flags
    }

    /// Version of the loader the image expects to be started by.
    pub fn loader_version(&self) -> u32 {
        u32::from_le_bytes(self.loader_version)
    }

    /// Keys the image hands over to the next boot stage.
    /// A slot that is all zeros or all ones is empty.
    pub fn next_stage_keys(&self) -> [Option<&PublicKey>; 2] {
        let present = |k: &PublicKey| {
            !(k.iter().all(|&b| b == 0) || k.iter().all(|&b| b == 0xFF))
        };
        [
            Some(&self.next_image_public_key_1).filter(|k| present(*k)),
            Some(&self.next_image_public_key_2).filter(|k| present(*k)),
        ]
    }

    pub fn crc(&self) -> u32 {
        u32::from_le_bytes(self.crc)
    }
}

/// Header at the start of every image partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    auth: AuthBlock,
    context: ContextBlock,
}

impl ImageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 2048;

    /// Offset of the context block inside the header.
    pub const CONTEXT_OFFSET: usize = AuthBlock::SIZE;

    /// Bytes between the end of the context block and the body.
    pub const PADDING: usize = Self::SIZE - AuthBlock::SIZE - ContextBlock::SIZE;

    /// Build the header for `body` and sign it.
    ///
    /// The body must be in its final (possibly compressed) form.
    pub fn seal(
        body: &[u8],
        key_selector: u32,
        algorithm: HashAlgorithm,
        flags: ImageFlags,
        hasher: &mut impl ImageHasher,
        signer: &impl ImageSign,
    ) -> Result<Self, Error> {
        let fw_length = u32::try_from(body.len()).map_err(|_| Error::FirmwareTooLong)?;
        let context = ContextBlock::new(fw_length, key_selector, algorithm, flags, 0, [None; 2]);

        let mut raw = [0u8; ContextBlock::SIZE];
        context.serialize(&mut raw)?;
        hasher.start(algorithm).map_err(Error::Hash)?;
        hasher.update(&raw).map_err(Error::Hash)?;
        hasher.update(body).map_err(Error::Hash)?;
        let digest = hasher.finish().map_err(Error::Hash)?;

        let mut auth = AuthBlock {
            fingerprint: [0; FINGERPRINT_SIZE],
            signature: signer.sign_rsa(key_selector, digest.as_bytes()),
        };
        auth.fingerprint[..digest.len].copy_from_slice(digest.as_bytes());

        Ok(Self { auth, context })
    }

    /// Reads the header without verifying the signature. Only the context CRC
    /// is checked, so be careful with trusting the data.
    ///
    /// Use [`Authenticator`] to verify an image.
    pub fn parse_unverified(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::HeaderTooShort);
        }
        Ok(Self {
            auth: AuthBlock::deserialize(data)?,
            context: ContextBlock::parse(&data[Self::CONTEXT_OFFSET..])?,
        })
    }

    /// Serialize the header to a buffer. Exactly [`Self::SIZE`] bytes will be
    /// written.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::SerializeBufferTooSmall);
        }
        self.auth.serialize(buf)?;
        self.context.serialize(&mut buf[Self::CONTEXT_OFFSET..])?;
        buf[Self::SIZE - Self::PADDING..Self::SIZE].fill(0);
        Ok(())
    }

    pub fn auth(&self) -> &AuthBlock {
        &self.auth
    }

    pub fn context(&self) -> &ContextBlock {
        &self.context
    }

    /// Declared body length in bytes.
    pub fn fw_length(&self) -> u32 {
        self.context.fw_length()
    }

    /// Header plus declared body length.
    pub fn image_length(&self) -> u32 {
        self.fw_length().saturating_add(Self::SIZE as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    ContextCrcMismatch { stored: u32, computed: u32 },
    FirmwareTooLong,
    Hash(HashError),
    HeaderTooShort,
    SerializeBufferTooSmall,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ContextCrcMismatch { stored, computed } => write!(
                f,
                "context block CRC mismatch: stored {stored:#010x}, computed {computed:#010x}"
            ),
            Self::FirmwareTooLong => write!(f, "firmware too long"),
            Self::Hash(HashError::Unsupported) => write!(f, "hash algorithm not supported"),
            Self::Hash(HashError::Engine) => write!(f, "hash engine error"),
            Self::HeaderTooShort => write!(f, "header too short"),
            Self::SerializeBufferTooSmall => write!(f, "buffer too small for serialization"),
        }
    }
}

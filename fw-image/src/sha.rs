// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    crate::{Digest, HashAlgorithm, HashError, ImageHasher},
    sha2::{Digest as _, Sha224, Sha256, Sha384, Sha512},
};

/// Software SHA-2 engine.
///
/// SHA-1 and SHA3-512 images need a hardware engine and report
/// [`HashError::Unsupported`].
#[derive(Default)]
pub struct Sha2Hasher {
    state: State,
}

#[derive(Default)]
enum State {
    #[default]
    Idle,
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Sha2Hasher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageHasher for Sha2Hasher {
    fn start(&mut self, algorithm: HashAlgorithm) -> Result<(), HashError> {
        self.state = match algorithm {
            HashAlgorithm::Sha224 => State::Sha224(Sha224::new()),
            HashAlgorithm::Sha256 => State::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => State::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => State::Sha512(Sha512::new()),
            HashAlgorithm::Sha1 | HashAlgorithm::Sha3_512 => {
                self.state = State::Idle;
                return Err(HashError::Unsupported);
            }
        };
        Ok(())
    }

    fn update(&mut self, data: &[u8]) -> Result<(), HashError> {
        match &mut self.state {
            State::Idle => return Err(HashError::Engine),
            State::Sha224(h) => h.update(data),
            State::Sha256(h) => h.update(data),
            State::Sha384(h) => h.update(data),
            State::Sha512(h) => h.update(data),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Digest, HashError> {
        let digest = match core::mem::take(&mut self.state) {
            State::Idle => None,
            State::Sha224(h) => Digest::from_slice(&h.finalize()),
            State::Sha256(h) => Digest::from_slice(&h.finalize()),
            State::Sha384(h) => Digest::from_slice(&h.finalize()),
            State::Sha512(h) => Digest::from_slice(&h.finalize()),
        };
        digest.ok_or(HashError::Engine)
    }
}
